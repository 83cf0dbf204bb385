//! # ctnet-events
//!
//! Container lifecycle events as delivered by the container engine's event
//! stream, and the policy deciding which of them drive network attachment.
//!
//! ## Wire Model
//!
//! The engine emits one JSON object per line:
//!
//! ```text
//! {"Type":"container","Action":"create","Actor":{"ID":"…","Attributes":{"name":"web","image":"nginx"}},"time":1700000000}
//! ```
//!
//! `EngineEvent` mirrors that shape. Unknown fields are ignored.
//!
//! ## Classification
//!
//! `classify` maps an event onto the transitions the daemon acts on:
//! - container `create` / `start` / `die` / `destroy`
//! - image `pull` / `delete`
//! - informational only: `exec_start:*`, `oom`
//!
//! Everything else is reported as unhandled.
//!
//! ## Filtering
//!
//! `EventFilter` rejects containers with an empty id, containers whose image
//! is a bare content hash (build intermediates), and containers whose names
//! are reserved for other agents.

mod error;
mod filter;
mod message;
mod types;

pub use error::EventError;
pub use filter::{is_content_addressed, EventFilter, SkipReason};
pub use message::{Actor, EngineEvent, EventKind};
pub use types::*;
