//! # astron-core
//!
//! The message director: the channel router at the center of an Astron
//! cluster.
//!
//! - **MessageDirector** - ingestion queue, dispatch loop and participant registry
//! - **ChannelTable** - one task per subscribed channel
//! - **RangeMap** - disjoint interval table for range subscriptions
//! - **UpstreamLink** - mirrors subscription state to a parent director
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌──────────────┐
//! │ Participant │────▶│ MessageDirector  │────▶│ ChannelTable │──▶ units
//! └─────────────┘     │  (dispatch loop) │     └──────────────┘
//!                     └──────────────────┘     ┌──────────────┐
//!                              │          ────▶│   RangeMap   │
//!                              ▼               └──────────────┘
//!                     ┌──────────────────┐
//!                     │   UpstreamLink   │
//!                     └──────────────────┘
//! ```

pub mod channel;
pub mod director;
pub mod participant;
pub mod range_map;
pub mod subscriber;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::ChannelTable;
pub use director::{DirectorConfig, DirectorError, DirectorStats, MessageDirector};
pub use participant::{Participant, ParticipantBase, ParticipantId, UPSTREAM_PARTICIPANT};
pub use range_map::{Range, RangeChange, RangeError, RangeMap};
pub use subscriber::{PostRemoves, Subscriber};
pub use upstream::UpstreamLink;
