//! Test doubles shared by the unit tests in this crate.

use crate::director::MessageDirector;
use crate::participant::{Participant, ParticipantId};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A participant that records everything delivered to it.
pub struct RecordingParticipant {
    id: ParticipantId,
    deliveries: mpsc::UnboundedSender<Bytes>,
    terminations: Mutex<Vec<String>>,
}

impl RecordingParticipant {
    pub fn new(id: ParticipantId) -> (Arc<Self>, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let participant = Arc::new(Self {
            id,
            deliveries: tx,
            terminations: Mutex::new(Vec::new()),
        });
        (participant, Inbox { rx })
    }

    /// Create a participant with a fresh id and register it on `director`.
    pub fn attach(director: &Arc<MessageDirector>) -> (Arc<Self>, Inbox) {
        let (participant, inbox) = Self::new(director.next_participant_id());
        director.register(participant.clone());
        (participant, inbox)
    }

    pub fn terminations(&self) -> Vec<String> {
        self.terminations.lock().unwrap().clone()
    }
}

impl Participant for RecordingParticipant {
    fn id(&self) -> ParticipantId {
        self.id
    }

    fn deliver(&self, datagram: Bytes) {
        let _ = self.deliveries.send(datagram);
    }

    fn terminate(&self, reason: &str) {
        self.terminations.lock().unwrap().push(reason.to_string());
    }
}

/// Receiving end of a [`RecordingParticipant`].
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Inbox {
    /// Wait up to a second for the next delivery.
    pub async fn expect(&mut self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for a delivery")
            .expect("participant dropped")
    }

    /// Assert nothing arrives within a short grace period.
    pub async fn expect_none(&mut self) {
        if let Ok(Some(dg)) = tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await {
            panic!("unexpected delivery: {:?}", dg);
        }
    }

    /// Everything delivered within a short grace period.
    pub async fn drain(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(Some(dg)) = tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await {
            out.push(dg);
        }
        out
    }
}
