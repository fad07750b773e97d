//! Client side of the MIDAS data acquisition framework
//!
//! - [`odb`]: the [`Odb`] trait over the Online DataBase, and MIDAS key types.
//! - [`jsonrpc`]: [`JsonRpcOdb`], talking to an experiment through `mhttpd`.
//! - [`memory`]: [`MemoryOdb`], a self-contained ODB for offline use.
//! - [`bank`]: event headers and data banks.
//! - [`sink`]: where finished events go.

pub mod bank;
pub mod jsonrpc;
pub mod memory;
pub mod odb;
pub mod sink;

pub use bank::{BankBuilder, BankError, Event, EventHeader};
pub use jsonrpc::JsonRpcOdb;
pub use memory::MemoryOdb;
pub use odb::{MessageType, Odb, OdbError, Tid};
pub use sink::{EventSink, LogSink, MemorySink, MidFileSink};
