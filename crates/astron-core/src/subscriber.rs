//! Per-participant bookkeeping owned by the message director.

use crate::participant::{Participant, ParticipantId};
use crate::range_map::Range;
use astron_protocol::Channel;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The router-side handle for one participant's discrete subscriptions.
///
/// Range subscriptions are tracked by the range map's reverse index.
pub struct Subscriber {
    participant: Arc<dyn Participant>,
    channels: HashSet<Channel>,
}

impl Subscriber {
    #[must_use]
    pub fn new(participant: Arc<dyn Participant>) -> Self {
        Self {
            participant,
            channels: HashSet::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ParticipantId {
        self.participant.id()
    }

    #[must_use]
    pub fn participant(&self) -> &Arc<dyn Participant> {
        &self.participant
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.channels.contains(&channel)
    }

    /// Returns `true` if the channel was not already held.
    pub fn add_channel(&mut self, channel: Channel) -> bool {
        self.channels.insert(channel)
    }

    /// Returns `true` if the channel was held.
    pub fn remove_channel(&mut self, channel: Channel) -> bool {
        self.channels.remove(&channel)
    }

    /// Remove and return every held channel inside `range`.
    pub fn take_channels_in(&mut self, range: Range) -> Vec<Channel> {
        let inside: Vec<Channel> = self
            .channels
            .iter()
            .copied()
            .filter(|ch| range.contains(*ch))
            .collect();
        for ch in &inside {
            self.channels.remove(ch);
        }
        inside
    }

    /// Remove and return every held channel.
    pub fn take_channels(&mut self) -> Vec<Channel> {
        self.channels.drain().collect()
    }

    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.channels.iter().copied().collect()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Datagrams a participant wants routed if it disconnects, keyed by the
/// channel they were registered under.
#[derive(Debug, Default)]
pub struct PostRemoves {
    pending: HashMap<Channel, Vec<Bytes>>,
}

impl PostRemoves {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: Channel, datagram: Bytes) {
        self.pending.entry(channel).or_default().push(datagram);
    }

    /// Discard everything registered under `channel`, returning how many were dropped.
    pub fn clear(&mut self, channel: Channel) -> usize {
        self.pending.remove(&channel).map_or(0, |dgs| dgs.len())
    }

    /// Empty the registry, yielding `(channel, datagrams)` pairs to fire.
    pub fn take_all(&mut self) -> Vec<(Channel, Vec<Bytes>)> {
        self.pending.drain().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
