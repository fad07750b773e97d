use std::io;

use thiserror::Error;

pub use crate::{
    client::ClientError,
    messages::MessageError,
    midas::{BankError, OdbError},
};

/// Failures of the frontend, mapped onto the MIDAS `FE_*` status they stand for
#[derive(Error, Debug)]
pub enum FrontendError {
    /// `FE_ERR_HW`: EPICS could not be reached, or a channel failed
    #[error("Hardware error: {0}")]
    HardwareError(String),
    #[error("ODB access failed: {0}")]
    Odb(#[from] OdbError),
    #[error("Could not deliver event: {0}")]
    Sink(#[source] io::Error),
    #[error("Could not build event: {0}")]
    Bank(#[from] BankError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl FrontendError {
    /// Whether this stands for a hardware (EPICS side) failure
    pub fn is_hardware(&self) -> bool {
        matches!(self, FrontendError::HardwareError(_))
    }
}
