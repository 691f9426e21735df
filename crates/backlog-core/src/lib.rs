//! backlog-core library.
//!
//! A file-backed work-item store: every item is one Markdown record under
//! `products/<product>/items/`, mutated through [`Store`] under per-item
//! locks, with an optional SQLite index that can always be rebuilt from
//! the records.
//!
//! # Conventions
//!
//! - **Errors**: [`StoreError`] for everything callers can act on;
//!   `anyhow::Result` inside [`config`] and [`db`].
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod alloc;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod facade;
pub mod guard;
pub mod layout;
pub mod lock;
pub mod model;
pub mod parent_sync;
pub mod store;
pub mod workflow;
pub mod worklog;

pub use error::{ErrorCode, Result, StoreError};
pub use facade::{ListOutcome, QueryFacade, RecordSource, SourceKind};
pub use model::{DerivedIndexRow, ItemFilter, Kind, ProcessProfile, WorkItem, WorklogEntry};
pub use parent_sync::{SyncMove, SyncReport};
pub use store::{CreateOptions, InitOptions, Store, Written};
pub use workflow::{ReadyReport, TransitionOptions, TransitionOutcome};
