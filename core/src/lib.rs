//! Reader-side reconciliation of relay-sequenced jar logs.
//!
//! The relay numbers every receipt of a jar and delivers envelopes to members
//! over an unreliable network: out of order, duplicated, or not at all. This
//! crate applies each envelope of a jar exactly once, strictly in sequence
//! order, recovering missing ranges from the relay and halting the jar when
//! the relay contradicts what was already applied.
//!
//! - [`Reconciler`] is the per-jar state machine.
//! - [`BackfillCoordinator`] recovers missing ranges.
//! - [`JarSyncService`] serializes work per jar and drives polling.
//! - [`store`] holds the durable state shared across instances and restarts.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::dbg_macro,
	deprecated
)]
#![allow(
	clippy::missing_errors_doc,
	clippy::module_name_repetitions,
	clippy::cast_possible_truncation
)]

pub mod apply;
pub mod backfill;
pub mod config;
mod error;
pub mod logging;
pub mod metrics;
pub mod reconciler;
pub mod service;
pub mod store;

pub use apply::{ApplyError, ApplyErrorKind, Applier};
pub use backfill::{BackfillCoordinator, BackfillReport, JarHandle};
pub use config::SyncConfig;
pub use error::Error;
pub use logging::init_tracing;
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use reconciler::{
	BackfillIngest, Disposition, DrainReport, GapHandling, ProcessOutcome, Reconciler,
};
pub use service::{JarSyncService, PollReport};
pub use store::{SequenceState, SyncStore};

pub use jar_sync;
