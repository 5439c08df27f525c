//! chatrelay runtime: the stream orchestrator and the transcript persister.
//!
//! The orchestrator relays upstream chunks to the caller while buffering
//! them; when the turn ends for any reason the persister writes the user and
//! assistant messages in one unit of work.

pub mod orchestrator;
pub mod persister;
pub mod types;

pub use orchestrator::{ChatTurn, EventStream, Orchestrator};
pub use persister::{TranscriptPersister, TurnSummary};
pub use types::*;
