//! Error taxonomy for the host-stack core (see spec §7).

use thiserror::Error;

/// Errors surfaced by the buffer pool (§4.1).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferPoolError {
    #[error("out of memory: page mapping failed")]
    OutOfMemory,
}

/// Errors surfaced by the address allocator (§4.2).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    #[error("no free USB addresses on this HCD")]
    Exhausted,
}

/// The crate-wide error taxonomy. Every subsystem error folds into one
/// of these kinds; drivers and the enumeration state machine branch on
/// the kind, never on a subsystem-specific variant.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("no such device")]
    NoDevice,
    #[error("no such pipe")]
    NoPipe,
    #[error("no such interface")]
    NoInterface,
    #[error("out of memory")]
    OutOfMemory,
    #[error("transaction or babble error reported by the HCD")]
    Io,
    #[error("transfer timed out")]
    Timeout,
    #[error("transfer aborted")]
    Aborted,
    #[error("malformed descriptor or protocol violation")]
    Protocol,
    #[error("transfer type not supported by this backend")]
    NotSupported,
}

impl From<BufferPoolError> for CoreError {
    fn from(_: BufferPoolError) -> Self {
        CoreError::OutOfMemory
    }
}

impl From<AddressError> for CoreError {
    fn from(_: AddressError) -> Self {
        CoreError::OutOfMemory
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
