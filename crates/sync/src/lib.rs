//! Data model and collaborator contracts for jar log replication.
//!
//! A jar is an append-only log sequenced by a single relay. This crate holds
//! what every reader of that log shares: the envelope as delivered by the
//! relay, the ranges used to ask for missing envelopes, and the traits a
//! reader implements or consumes to verify envelopes and query the relay.

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
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod envelope;
mod range;
mod relay;
mod signing;
mod verify;

pub use envelope::*;
pub use range::*;
pub use relay::*;
pub use signing::*;
pub use verify::*;
