//! Participants: anything that can subscribe to channels and receive datagrams.
//!
//! Network connections, the upstream link and in-process server roles all
//! implement [`Participant`]. In-process roles embed a [`ParticipantBase`] to
//! talk to the message director without a socket hop.

use crate::director::{DirectorError, MessageDirector};
use crate::range_map::Range;
use astron_protocol::Channel;
use bytes::Bytes;
use std::sync::Arc;

/// Router-assigned participant identifier.
pub type ParticipantId = u64;

/// Identifier reserved for the upstream link. Local ids start at 1.
pub const UPSTREAM_PARTICIPANT: ParticipantId = 0;

/// A routing endpoint known to the message director.
pub trait Participant: Send + Sync {
    /// The id this participant was registered under.
    fn id(&self) -> ParticipantId;

    /// Hand a routed datagram to the participant.
    ///
    /// Called from the dispatch task and from channel units, so it must not
    /// block. Network participants queue the datagram for their writer.
    fn deliver(&self, datagram: Bytes);

    /// The router is dropping this participant (malformed input, shutdown).
    fn terminate(&self, reason: &str);
}

/// Router-facing half of an in-process or network participant.
///
/// Holds the participant's id and a handle to the director; every call is
/// made on behalf of that id.
#[derive(Clone)]
pub struct ParticipantBase {
    id: ParticipantId,
    director: Arc<MessageDirector>,
}

impl ParticipantBase {
    /// Allocate a fresh participant id on `director`.
    ///
    /// The owner must call [`MessageDirector::register`] with its
    /// [`Participant`] handle before subscribing.
    #[must_use]
    pub fn new(director: Arc<MessageDirector>) -> Self {
        let id = director.next_participant_id();
        Self { id, director }
    }

    #[must_use]
    pub fn id(&self) -> ParticipantId {
        self.id
    }

    #[must_use]
    pub fn director(&self) -> &Arc<MessageDirector> {
        &self.director
    }

    /// Queue a datagram sent by this participant for routing.
    ///
    /// Waits while the ingestion queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`DirectorError::Shutdown`] if the dispatch loop has stopped.
    pub async fn receive_inbound(&self, datagram: Bytes) -> Result<(), DirectorError> {
        self.director.receive_inbound(Some(self.id), datagram).await
    }

    pub fn subscribe_channel(&self, channel: Channel) -> Result<(), DirectorError> {
        self.director.subscribe_channel(self.id, channel)
    }

    pub fn unsubscribe_channel(&self, channel: Channel) -> Result<(), DirectorError> {
        self.director.unsubscribe_channel(self.id, channel)
    }

    pub fn subscribe_range(&self, min: Channel, max: Channel) -> Result<(), DirectorError> {
        self.director.subscribe_range(self.id, Range::new(min, max)?)
    }

    pub fn unsubscribe_range(&self, min: Channel, max: Channel) -> Result<(), DirectorError> {
        self.director.unsubscribe_range(self.id, Range::new(min, max)?)
    }

    pub fn add_post_remove(&self, channel: Channel, datagram: Bytes) -> Result<(), DirectorError> {
        self.director.add_post_remove(self.id, channel, datagram)
    }

    pub fn clear_post_removes(&self, channel: Channel) -> Result<(), DirectorError> {
        self.director.clear_post_removes(self.id, channel)
    }

    /// Leave the router: drop every subscription and fire pending post-removes.
    ///
    /// Safe to call more than once; only the first call has any effect.
    pub async fn terminate(&self) -> Result<(), DirectorError> {
        self.director.terminate_participant(self.id).await
    }
}

impl std::fmt::Debug for ParticipantBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantBase").field("id", &self.id).finish()
    }
}
