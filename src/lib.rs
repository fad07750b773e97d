//! Bridge from EPICS Channel Access to a MIDAS experiment.
//!
//! `epics_fe` is a MIDAS frontend with a single periodic equipment. It reads a
//! configurable list of EPICS process variables on a fixed interval, stores the
//! latest values in the ODB, and sends them on as a float bank in every event.
//!
//! It is built from:
//!
//! - A pure-rust [EPICS CA protocol] client: message serialization in [messages],
//!   ["DBR" types] in [dbr], and name search plus TCP circuits in [client]. It does
//!   not depend on the C-based [epics-base] project at all.
//! - A MIDAS client layer in [midas]: the [`midas::Odb`] trait with an `mhttpd`
//!   JSON-RPC implementation and an in-memory one, the event and bank format, and
//!   [`midas::EventSink`]s that events are delivered to.
//! - The [frontend] runtime tying the two together, configured through [config].
//!
//! ## Example
//!
//! Running a frontend against an in-memory ODB, without any IOCs:
//!
//! ```
//! use epics_fe::{
//!     frontend::{Frontend, FrontendConfig},
//!     midas::{MemoryOdb, MemorySink},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let odb = MemoryOdb::new();
//!     let sink = MemorySink::new();
//!     let mut frontend = Frontend::new(odb, sink.clone(), FrontendConfig::default());
//!     frontend.init().await.unwrap();
//!     frontend.readout().await.unwrap();
//!     assert_eq!(sink.events().len(), 1);
//! }
//! ```
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod client;
pub mod config;
pub mod dbr;
pub mod error;
pub mod frontend;
pub mod messages;
pub mod midas;

mod utils;
