//! Channel Access client: name resolution and virtual circuits
#[allow(clippy::module_inception)]
mod client;
mod searcher;

pub use searcher::{CouldNotFindError, PendingSearch, Searcher, SearcherBuilder};

pub use client::{Client, ClientError, PvChannel};
