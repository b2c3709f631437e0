//! Core types for the tandem transaction coordinator.
//!
//! This crate holds the leaf types every other part of the coordinator is
//! built on: the error model, the XA capability interface with its flag and
//! error-code constants, the fixed-layout UID/Xid identifiers, and the
//! positional scheduler used to order two-phase-commit participants and
//! completion synchronizations.

#![warn(missing_docs)]

pub mod error;
pub mod scheduler;
pub mod uid;
pub mod xa;

pub use error::{Result, TransactionError};
pub use scheduler::{PositionalScheduler, ALWAYS_LAST_POSITION, DEFAULT_POSITION};
pub use uid::{Uid, UidGenerator, Xid};
pub use xa::{PrepareVote, XaError, XaErrorCode, XaResource};
