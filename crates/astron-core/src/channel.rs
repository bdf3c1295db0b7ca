//! Channel actor table.
//!
//! Every channel with at least one discrete subscriber is served by its own
//! task (a channel unit) that owns the subscriber list. The table maps channel
//! ids to unit mailboxes. Creation and teardown both happen under the table's
//! per-key lock, so a subscribe that races a teardown always ends up with a
//! live unit.

use crate::participant::{Participant, ParticipantId};
use crate::upstream::UpstreamLink;
use astron_protocol::Channel;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Commands accepted by a channel unit.
enum ChannelCommand {
    Subscribe(Arc<dyn Participant>),
    Unsubscribe(ParticipantId),
    Deliver {
        datagram: Bytes,
        exclude: Option<ParticipantId>,
    },
    Resolve(oneshot::Sender<Vec<Arc<dyn Participant>>>),
}

struct ChannelEntry {
    mailbox: mpsc::UnboundedSender<ChannelCommand>,
    /// Mirrors the unit's subscriber count for teardown decisions.
    subscribers: usize,
}

/// Map from channel id to the unit serving it.
pub struct ChannelTable {
    units: DashMap<Channel, ChannelEntry>,
    /// Ordered copy of the keys of `units`, for range queries. Only locked
    /// after a `units` shard, never before.
    live: Mutex<BTreeSet<Channel>>,
    upstream: Option<Arc<UpstreamLink>>,
}

impl ChannelTable {
    /// Create an empty table. When `upstream` is set, a channel's first
    /// subscriber and last unsubscriber are mirrored to the parent MD.
    #[must_use]
    pub fn new(upstream: Option<Arc<UpstreamLink>>) -> Self {
        Self {
            units: DashMap::new(),
            live: Mutex::new(BTreeSet::new()),
            upstream,
        }
    }

    /// Add `participant` to `channel`, spawning a unit if none exists.
    ///
    /// The caller guarantees the participant is not already subscribed.
    /// Returns `true` if this created the unit.
    pub fn subscribe(&self, channel: Channel, participant: Arc<dyn Participant>) -> bool {
        match self.units.entry(channel) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.subscribers += 1;
                let _ = entry.mailbox.send(ChannelCommand::Subscribe(participant));
                false
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(ChannelCommand::Subscribe(participant));
                tokio::spawn(run_unit(channel, rx));
                // The index changes only while the shard entry is held.
                self.live().insert(channel);
                vacant.insert(ChannelEntry {
                    mailbox: tx,
                    subscribers: 1,
                });
                debug!(channel, "Channel unit started");
                if let Some(upstream) = &self.upstream {
                    upstream.subscribe_channel(channel);
                }
                true
            }
        }
    }

    /// Remove participant `id` from `channel`, tearing the unit down when it
    /// loses its last subscriber. Returns `true` if the unit was torn down.
    pub fn unsubscribe(&self, channel: Channel, id: ParticipantId) -> bool {
        let Entry::Occupied(mut occupied) = self.units.entry(channel) else {
            return false;
        };

        let entry = occupied.get_mut();
        let _ = entry.mailbox.send(ChannelCommand::Unsubscribe(id));
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return false;
        }

        // Dropping the mailbox sender lets the unit drain and exit.
        self.live().remove(&channel);
        occupied.remove();
        debug!(channel, "Channel unit stopped");
        if let Some(upstream) = &self.upstream {
            upstream.unsubscribe_channel(channel);
        }
        true
    }

    /// Hand `datagram` to the unit for `channel`.
    ///
    /// Returns `false` if no unit exists, in which case the datagram is dropped.
    pub fn deliver(&self, channel: Channel, datagram: Bytes, exclude: Option<ParticipantId>) -> bool {
        match self.units.get(&channel) {
            Some(entry) => entry
                .mailbox
                .send(ChannelCommand::Deliver { datagram, exclude })
                .is_ok(),
            None => {
                trace!(channel, "No discrete subscribers");
                false
            }
        }
    }

    /// Ask the unit for `channel` for its current subscribers.
    ///
    /// Returns `None` if no unit exists. The request is queued behind any
    /// earlier commands, so the answer reflects them.
    pub fn resolve(
        &self,
        channel: Channel,
    ) -> Option<impl Future<Output = Vec<Arc<dyn Participant>>>> {
        let (reply, response) = oneshot::channel();
        self.units
            .get(&channel)?
            .mailbox
            .send(ChannelCommand::Resolve(reply))
            .ok()?;
        Some(async move { response.await.unwrap_or_default() })
    }

    #[must_use]
    pub fn contains(&self, channel: Channel) -> bool {
        self.units.contains_key(&channel)
    }

    #[must_use]
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.units.get(&channel).map_or(0, |e| e.subscribers)
    }

    /// Channels with a live unit inside `[min, max]`.
    #[must_use]
    pub fn channels_between(&self, min: Channel, max: Channel) -> Vec<Channel> {
        if min > max {
            return Vec::new();
        }
        self.live().range(min..=max).copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn live(&self) -> MutexGuard<'_, BTreeSet<Channel>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ChannelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTable")
            .field("units", &self.units.len())
            .field("upstream", &self.upstream.is_some())
            .finish()
    }
}

/// A channel unit: owns the subscriber list for one channel and processes
/// its mailbox in order until the table drops the sender.
async fn run_unit(channel: Channel, mut mailbox: mpsc::UnboundedReceiver<ChannelCommand>) {
    let mut subscribers: Vec<Arc<dyn Participant>> = Vec::new();

    while let Some(command) = mailbox.recv().await {
        match command {
            ChannelCommand::Subscribe(participant) => {
                let id = participant.id();
                if !subscribers.iter().any(|p| p.id() == id) {
                    subscribers.push(participant);
                }
            }
            ChannelCommand::Unsubscribe(id) => {
                subscribers.retain(|p| p.id() != id);
            }
            ChannelCommand::Deliver { datagram, exclude } => {
                for participant in &subscribers {
                    if Some(participant.id()) != exclude {
                        participant.deliver(datagram.clone());
                    }
                }
            }
            ChannelCommand::Resolve(reply) => {
                let _ = reply.send(subscribers.clone());
            }
        }
    }

    trace!(channel, remaining = subscribers.len(), "Channel unit exited");
}
