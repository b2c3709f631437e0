//! Standalone XA two-phase-commit transaction coordinator.
//!
//! `tandem-tm` coordinates ACID transactions spanning multiple resource
//! managers (databases, message queues) that expose an XA-style branch
//! interface. Commit decisions are force-written to a dual-file rotating
//! journal before phase 2 runs, so a crash at any point is finished by the
//! recovery engine: journaled decisions are driven forward, everything else
//! is presumed aborted.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tandem_tm::{Configuration, ServiceContext, TransactionManager};
//!
//! # async fn demo(resource: Arc<dyn tandem_core::XaResource>, bean: Arc<tandem_tm::ResourceBean>) -> tandem_core::Result<()> {
//! let config = Configuration::builder()
//!     .server_id("node-1")
//!     .journal_files("/var/lib/tandem/part1.tlog", "/var/lib/tandem/part2.tlog")
//!     .build()?;
//! let manager = TransactionManager::new(ServiceContext::new(config));
//! manager.start().await?;
//!
//! let transaction = manager.begin().await?;
//! transaction.enlist(resource, bean).await?;
//! // ... perform work on the enlisted connection ...
//! manager.commit(&transaction).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`transaction`] | per-transaction coordinator and status machine |
//! | [`twopc`] | parallel prepare/commit/rollback with heuristic classification |
//! | [`journal`] | durable, CRC-protected, rotating decision log |
//! | [`recovery`] | full and incremental reconciliation of in-doubt branches |
//! | [`resource`] | resource descriptors, producers and the process registry |
//! | [`timer`] | timed tasks: transaction timeouts, background recovery |
//! | [`manager`] | lifecycle façade and the per-process service context |

pub mod branch;
pub mod config;
pub mod journal;
pub mod manager;
pub mod recovery;
pub mod resource;
pub mod status;
pub mod timer;
pub mod transaction;
pub mod twopc;

pub use branch::BranchState;
pub use config::{Configuration, ConfigurationBuilder};
pub use journal::{DanglingRecord, DiskJournal};
pub use manager::{ServiceContext, TransactionManager};
pub use recovery::{InFlightSnapshot, Recoverer, RecoveryResult};
pub use resource::{ResourceBean, ResourceProducer, ResourceRegistry};
pub use status::TxStatus;
pub use timer::{ScheduledTask, TaskHandle, TaskScheduler};
pub use transaction::{Synchronization, Transaction, INTERPOSED_SYNCHRONIZATION_POSITION};
pub use twopc::Executor;

pub use tandem_core::{
    PrepareVote, Result, TransactionError, Uid, UidGenerator, XaError, XaErrorCode, XaResource,
    Xid,
};
