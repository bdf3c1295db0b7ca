//! Link to a parent message director.
//!
//! A downstream MD mirrors its aggregate subscription state to its parent
//! through control datagrams, and relays locally originated traffic upward.
//! The link itself only builds datagrams and queues them; the server owns the
//! socket and drains the queue.

use crate::participant::{Participant, ParticipantId, UPSTREAM_PARTICIPANT};
use crate::range_map::Range;
use astron_protocol::msgtypes::ControlMessage;
use astron_protocol::{Channel, Datagram};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, trace};

/// Outbound half of the connection to the parent MD.
#[derive(Debug)]
pub struct UpstreamLink {
    outbound: mpsc::UnboundedSender<Bytes>,
    lost: AtomicBool,
    lost_notify: Notify,
}

impl UpstreamLink {
    /// Create a link and the receiver the socket writer drains.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            outbound: tx,
            lost: AtomicBool::new(false),
            lost_notify: Notify::new(),
        });
        (link, rx)
    }

    pub fn subscribe_channel(&self, channel: Channel) {
        debug!(channel, "Upstream add channel");
        let mut dg = Datagram::new();
        dg.add_control_header(ControlMessage::AddChannel.into())
            .add_channel(channel);
        self.send(dg.freeze());
    }

    pub fn unsubscribe_channel(&self, channel: Channel) {
        debug!(channel, "Upstream remove channel");
        let mut dg = Datagram::new();
        dg.add_control_header(ControlMessage::RemoveChannel.into())
            .add_channel(channel);
        self.send(dg.freeze());
    }

    pub fn subscribe_range(&self, range: Range) {
        debug!(%range, "Upstream add range");
        let mut dg = Datagram::new();
        dg.add_control_header(ControlMessage::AddRange.into())
            .add_channel(range.min)
            .add_channel(range.max);
        self.send(dg.freeze());
    }

    pub fn unsubscribe_range(&self, range: Range) {
        debug!(%range, "Upstream remove range");
        let mut dg = Datagram::new();
        dg.add_control_header(ControlMessage::RemoveRange.into())
            .add_channel(range.min)
            .add_channel(range.max);
        self.send(dg.freeze());
    }

    pub fn add_post_remove(&self, channel: Channel, datagram: &[u8]) {
        let mut dg = Datagram::with_capacity(datagram.len() + 23);
        dg.add_control_header(ControlMessage::AddPostRemove.into())
            .add_channel(channel)
            .add_datagram(datagram);
        self.send(dg.freeze());
    }

    pub fn clear_post_removes(&self, channel: Channel) {
        let mut dg = Datagram::new();
        dg.add_control_header(ControlMessage::ClearPostRemoves.into())
            .add_channel(channel);
        self.send(dg.freeze());
    }

    /// Forward a locally originated datagram to the parent unchanged.
    pub fn relay(&self, datagram: Bytes) {
        trace!(len = datagram.len(), "Relaying upstream");
        self.send(datagram);
    }

    /// Whether the connection to the parent has been lost.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Resolves once the link is marked lost.
    pub async fn lost(&self) {
        let notified = self.lost_notify.notified();
        if self.is_lost() {
            return;
        }
        notified.await;
    }

    fn send(&self, datagram: Bytes) {
        if self.outbound.send(datagram).is_err() && !self.is_lost() {
            error!("Upstream writer has shut down; dropping datagram");
        }
    }
}

impl Participant for UpstreamLink {
    fn id(&self) -> ParticipantId {
        UPSTREAM_PARTICIPANT
    }

    fn deliver(&self, datagram: Bytes) {
        self.relay(datagram);
    }

    fn terminate(&self, reason: &str) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            error!(reason, "Lost connection to upstream message director");
            self.lost_notify.notify_waiters();
        }
    }
}
