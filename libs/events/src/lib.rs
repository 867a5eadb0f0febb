//! # lbsync-events
//!
//! Routing-update event definitions for the lbsync controller.
//!
//! ## Design Principles
//!
//! - Events are emitted by the orchestrator's messaging plugin; this crate
//!   only decodes them, it never defines their transport
//! - Every event names exactly one application (`app_name` + `namespace`)
//! - Gear events additionally carry the gear's public address and port
//! - Decoding is lenient about spelling (`add_gear` and `add-gear`) but strict
//!   about required fields
//!
//! ## Event Envelope
//!
//! Events delivered through a feed are wrapped in an [`EventEnvelope`] that
//! carries the feed-assigned, monotonically increasing `event_id`. The id is
//! what a consumer acknowledges.
//!
//! ## Actions
//!
//! - `create_application` / `delete_application`
//! - `add_gear` / `remove_gear`

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
