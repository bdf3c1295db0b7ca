//! Shared fixtures for the message director benchmarks.

use astron_core::{Participant, ParticipantId};
use astron_protocol::{Channel, Datagram};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Participant that only counts deliveries.
pub struct CountingParticipant {
    id: ParticipantId,
    delivered: AtomicU64,
}

impl CountingParticipant {
    #[must_use]
    pub fn new(id: ParticipantId) -> Arc<Self> {
        Arc::new(Self {
            id,
            delivered: AtomicU64::new(0),
        })
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Participant for CountingParticipant {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn deliver(&self, _datagram: Bytes) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn terminate(&self, _reason: &str) {}
}

/// Participant that forwards deliveries to a channel, for latency runs.
pub struct ForwardingParticipant {
    id: ParticipantId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ForwardingParticipant {
    #[must_use]
    pub fn new(id: ParticipantId) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { id, tx }), rx)
    }
}

impl Participant for ForwardingParticipant {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn deliver(&self, datagram: Bytes) {
        let _ = self.tx.send(datagram);
    }

    fn terminate(&self, _reason: &str) {}
}

/// A server datagram to `to` with a zeroed payload.
#[must_use]
pub fn datagram(to: &[Channel], payload: usize) -> Bytes {
    let mut dg = Datagram::with_capacity(16 + to.len() * 8 + payload);
    dg.add_multiple_server_header(to, 1, 1000);
    dg.add_data(&vec![0u8; payload]);
    dg.freeze()
}
