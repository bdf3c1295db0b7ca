//! The message director: ingestion queue, dispatch loop and participant
//! registry.
//!
//! Participants push datagrams into a bounded queue. A single dispatch task
//! drains it in order, interprets control datagrams sent by participants and
//! routes everything else to the discrete channel units and the range map.
//! Locally originated traffic is relayed to the parent MD when one is
//! configured.

use crate::channel::ChannelTable;
use crate::participant::{Participant, ParticipantId};
use crate::range_map::{Range, RangeChange, RangeError, RangeMap};
use crate::subscriber::{PostRemoves, Subscriber};
use crate::upstream::UpstreamLink;
use astron_protocol::{Channel, ControlMessage, DatagramIterator, ProtocolError, CONTROL_MESSAGE};
use bytes::Bytes;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Errors surfaced by the message director.
#[derive(Debug, Error)]
pub enum DirectorError {
    /// A datagram could not be parsed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A range subscription had `min > max`.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// The participant is not (or no longer) registered.
    #[error("Unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    /// A control datagram arrived from the parent MD.
    #[error("Control message without an originating participant")]
    ControlWithoutOrigin,

    /// The dispatch loop has stopped.
    #[error("Message director has shut down")]
    Shutdown,
}

impl DirectorError {
    /// Whether the error means the sender produced a malformed datagram.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, DirectorError::Protocol(_) | DirectorError::Range(_))
    }
}

/// Director configuration.
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Capacity of the ingestion queue. Producers wait when it is full.
    pub queue_capacity: usize,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
        }
    }
}

/// Snapshot of routing state.
#[derive(Debug, Clone, Serialize)]
pub struct DirectorStats {
    pub participants: usize,
    pub channels: usize,
    pub range_intervals: usize,
    pub range_subscribers: usize,
    pub queued: usize,
    pub upstream: bool,
}

enum Inbound {
    Datagram {
        datagram: Bytes,
        origin: Option<ParticipantId>,
    },
    Barrier(oneshot::Sender<()>),
}

struct ParticipantEntry {
    subscriber: Subscriber,
    post_removes: PostRemoves,
    name: Option<String>,
    url: Option<String>,
}

/// What remains of a participant after it leaves the registry.
struct Detached {
    participant: Arc<dyn Participant>,
    post_removes: Vec<(Channel, Vec<Bytes>)>,
}

/// The central channel router.
pub struct MessageDirector {
    channels: ChannelTable,
    /// Lock order: a participant entry, then this, then a channel table shard.
    ranges: Mutex<RangeMap>,
    participants: DashMap<ParticipantId, ParticipantEntry>,
    queue: mpsc::Sender<Inbound>,
    upstream: Option<Arc<UpstreamLink>>,
    next_id: AtomicU64,
    config: DirectorConfig,
}

impl MessageDirector {
    /// Create a director and spawn its dispatch loop.
    ///
    /// The loop exits once the last handle to the director is dropped.
    #[must_use]
    pub fn start(config: DirectorConfig, upstream: Option<Arc<UpstreamLink>>) -> Arc<Self> {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        info!(
            queue_capacity = config.queue_capacity,
            upstream = upstream.is_some(),
            "Starting message director"
        );

        let director = Arc::new(Self {
            channels: ChannelTable::new(upstream.clone()),
            ranges: Mutex::new(RangeMap::new()),
            participants: DashMap::new(),
            queue,
            upstream,
            next_id: AtomicU64::new(1),
            config,
        });

        tokio::spawn(dispatch_loop(Arc::downgrade(&director), rx));
        director
    }

    #[must_use]
    pub fn config(&self) -> &DirectorConfig {
        &self.config
    }

    #[must_use]
    pub fn upstream(&self) -> Option<&Arc<UpstreamLink>> {
        self.upstream.as_ref()
    }

    /// Allocate an id for a new participant.
    pub fn next_participant_id(&self) -> ParticipantId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make `participant` known to the router under its id.
    pub fn register(&self, participant: Arc<dyn Participant>) {
        let id = participant.id();
        self.participants.insert(
            id,
            ParticipantEntry {
                subscriber: Subscriber::new(participant),
                post_removes: PostRemoves::new(),
                name: None,
                url: None,
            },
        );
        debug!(participant = id, "Participant registered");
    }

    #[must_use]
    pub fn is_registered(&self, id: ParticipantId) -> bool {
        self.participants.contains_key(&id)
    }

    /// Queue a datagram for routing. `origin` is `None` for traffic from the
    /// parent MD, which is routed locally but never relayed back up.
    ///
    /// # Errors
    ///
    /// Returns [`DirectorError::Shutdown`] if the dispatch loop has stopped.
    pub async fn receive_inbound(
        &self,
        origin: Option<ParticipantId>,
        datagram: Bytes,
    ) -> Result<(), DirectorError> {
        self.queue
            .send(Inbound::Datagram { datagram, origin })
            .await
            .map_err(|_| DirectorError::Shutdown)
    }

    /// Queue a datagram received from the parent MD.
    pub async fn receive_from_upstream(&self, datagram: Bytes) -> Result<(), DirectorError> {
        self.receive_inbound(None, datagram).await
    }

    /// Wait until every datagram queued before this call has been dispatched.
    ///
    /// Channel units may still be delivering when this returns.
    pub async fn sync(&self) -> Result<(), DirectorError> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Inbound::Barrier(tx))
            .await
            .map_err(|_| DirectorError::Shutdown)?;
        rx.await.map_err(|_| DirectorError::Shutdown)
    }

    /// Subscribe participant `id` to one channel.
    ///
    /// A no-op if the participant already holds the channel, either
    /// discretely or through one of its ranges.
    pub fn subscribe_channel(&self, id: ParticipantId, channel: Channel) -> Result<(), DirectorError> {
        let mut entry = self.entry(id)?;
        let ranges = self.ranges();
        if entry.subscriber.is_subscribed(channel) || ranges.covers(id, channel) {
            trace!(participant = id, channel, "Already subscribed");
            return Ok(());
        }

        entry.subscriber.add_channel(channel);
        self.channels
            .subscribe(channel, Arc::clone(entry.subscriber.participant()));
        debug!(participant = id, channel, "Subscribed to channel");
        Ok(())
    }

    /// Drop a discrete subscription. Channels held only through a range are
    /// left alone.
    pub fn unsubscribe_channel(&self, id: ParticipantId, channel: Channel) -> Result<(), DirectorError> {
        let mut entry = self.entry(id)?;
        let _ranges = self.ranges();
        if entry.subscriber.remove_channel(channel) {
            self.channels.unsubscribe(channel, id);
            debug!(participant = id, channel, "Unsubscribed from channel");
        }
        Ok(())
    }

    /// Subscribe participant `id` to every channel in `range`.
    ///
    /// Discrete subscriptions the range now covers are retracted so each
    /// channel is held exactly one way.
    pub fn subscribe_range(&self, id: ParticipantId, range: Range) -> Result<(), DirectorError> {
        let mut entry = self.entry(id)?;
        let participant = Arc::clone(entry.subscriber.participant());

        let mut ranges = self.ranges();
        let change = ranges.add(range, &participant);
        self.mirror_ranges(&change);
        for channel in entry.subscriber.take_channels_in(range) {
            self.channels.unsubscribe(channel, id);
        }

        debug!(participant = id, %range, "Subscribed to range");
        Ok(())
    }

    /// Drop `range` from participant `id`, along with any discrete channels
    /// inside it.
    pub fn unsubscribe_range(&self, id: ParticipantId, range: Range) -> Result<(), DirectorError> {
        let mut entry = self.entry(id)?;

        let mut ranges = self.ranges();
        for channel in entry.subscriber.take_channels_in(range) {
            self.channels.unsubscribe(channel, id);
        }
        let change = ranges.remove(range, id);
        self.mirror_ranges(&change);

        debug!(participant = id, %range, "Unsubscribed from range");
        Ok(())
    }

    /// Register `datagram` to be routed on the participant's behalf if it
    /// disconnects.
    pub fn add_post_remove(
        &self,
        id: ParticipantId,
        channel: Channel,
        datagram: Bytes,
    ) -> Result<(), DirectorError> {
        let mut entry = self.entry(id)?;
        if let Some(upstream) = &self.upstream {
            upstream.add_post_remove(channel, &datagram);
        }
        entry.post_removes.add(channel, datagram);
        trace!(participant = id, channel, "Post-remove added");
        Ok(())
    }

    pub fn clear_post_removes(&self, id: ParticipantId, channel: Channel) -> Result<(), DirectorError> {
        let mut entry = self.entry(id)?;
        let cleared = entry.post_removes.clear(channel);
        if let Some(upstream) = &self.upstream {
            upstream.clear_post_removes(channel);
        }
        trace!(participant = id, channel, cleared, "Post-removes cleared");
        Ok(())
    }

    pub fn set_name(&self, id: ParticipantId, name: String) -> Result<(), DirectorError> {
        let mut entry = self.entry(id)?;
        debug!(participant = id, %name, "Connection named");
        entry.name = Some(name);
        Ok(())
    }

    pub fn set_url(&self, id: ParticipantId, url: String) -> Result<(), DirectorError> {
        let mut entry = self.entry(id)?;
        debug!(participant = id, %url, "Connection URL set");
        entry.url = Some(url);
        Ok(())
    }

    #[must_use]
    pub fn name_of(&self, id: ParticipantId) -> Option<String> {
        self.participants.get(&id).and_then(|e| e.name.clone())
    }

    #[must_use]
    pub fn url_of(&self, id: ParticipantId) -> Option<String> {
        self.participants.get(&id).and_then(|e| e.url.clone())
    }

    /// Discrete channels held by participant `id`, sorted.
    #[must_use]
    pub fn channels_of(&self, id: ParticipantId) -> Vec<Channel> {
        let mut channels = self
            .participants
            .get(&id)
            .map(|e| e.subscriber.channels())
            .unwrap_or_default();
        channels.sort_unstable();
        channels
    }

    /// Ranges held by participant `id`, merged where adjacent.
    #[must_use]
    pub fn ranges_of(&self, id: ParticipantId) -> Vec<Range> {
        self.ranges().ranges_of(id)
    }

    /// Remove participant `id` from the router.
    ///
    /// Every subscription is dropped and the participant's post-remove
    /// datagrams are queued for routing as if it had sent them. Calling this
    /// for an id that is already gone does nothing.
    pub async fn terminate_participant(&self, id: ParticipantId) -> Result<(), DirectorError> {
        let Some(detached) = self.detach(id) else {
            return Ok(());
        };

        for (channel, datagrams) in detached.post_removes {
            for datagram in datagrams {
                self.receive_inbound(Some(id), datagram).await?;
            }
            if let Some(upstream) = &self.upstream {
                upstream.clear_post_removes(channel);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> DirectorStats {
        let participants = self.participants.len();
        let ranges = self.ranges();
        DirectorStats {
            participants,
            channels: self.channels.len(),
            range_intervals: ranges.interval_count(),
            range_subscribers: ranges.subscriber_count(),
            queued: self.queue.max_capacity() - self.queue.capacity(),
            upstream: self.upstream.is_some(),
        }
    }

    fn entry(&self, id: ParticipantId) -> Result<RefMut<'_, ParticipantId, ParticipantEntry>, DirectorError> {
        self.participants
            .get_mut(&id)
            .ok_or(DirectorError::UnknownParticipant(id))
    }

    fn ranges(&self) -> MutexGuard<'_, RangeMap> {
        self.ranges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mirror coverage changes to the parent MD.
    ///
    /// When a portion loses coverage the parent may have retracted our
    /// discrete channels inside it, so those are announced again.
    fn mirror_ranges(&self, change: &RangeChange) {
        let Some(upstream) = &self.upstream else {
            return;
        };
        for range in &change.added {
            upstream.subscribe_range(*range);
        }
        for range in &change.removed {
            upstream.unsubscribe_range(*range);
            for channel in self.channels.channels_between(range.min, range.max) {
                upstream.subscribe_channel(channel);
            }
        }
    }

    fn detach(&self, id: ParticipantId) -> Option<Detached> {
        let (_, mut entry) = self.participants.remove(&id)?;

        {
            let mut ranges = self.ranges();
            for channel in entry.subscriber.take_channels() {
                self.channels.unsubscribe(channel, id);
            }
            let change = ranges.remove_subscriber(id);
            self.mirror_ranges(&change);
        }

        let post_removes = entry.post_removes.take_all();
        info!(
            participant = id,
            name = entry.name.as_deref().unwrap_or(""),
            post_removes = post_removes.len(),
            "Participant removed"
        );

        Some(Detached {
            participant: Arc::clone(entry.subscriber.participant()),
            post_removes,
        })
    }

    async fn process(&self, datagram: Bytes, origin: Option<ParticipantId>) {
        let Err(err) = self.handle(datagram, origin).await else {
            return;
        };

        match (origin, err) {
            (Some(id), err) if err.is_malformed() => {
                warn!(participant = id, error = %err, "Malformed datagram; disconnecting participant");
                self.disconnect(id, &err.to_string()).await;
            }
            (None, err) if err.is_malformed() => {
                warn!(error = %err, "Malformed datagram from upstream; dropping");
            }
            (_, DirectorError::ControlWithoutOrigin) => {
                warn!("Ignoring control message received from upstream");
            }
            (origin, err) => {
                debug!(participant = ?origin, error = %err, "Dropping datagram");
            }
        }
    }

    /// Parse and route one datagram.
    async fn handle(&self, datagram: Bytes, origin: Option<ParticipantId>) -> Result<(), DirectorError> {
        let mut dgi = DatagramIterator::new(datagram);
        let recipients = dgi.recipients()?;

        if recipients.len() == 1 && recipients[0] == CONTROL_MESSAGE {
            return self.handle_control(origin, &mut dgi);
        }

        // Subscribers get sender, message type and payload; the recipient
        // list stays on the copy relayed to the parent.
        let header_len = dgi.tell();
        dgi.read_channel()?;
        dgi.read_u16()?;

        let datagram = dgi.datagram().clone();
        self.route(&recipients, &datagram.slice(header_len..), origin)
            .await;

        if origin.is_some() {
            if let Some(upstream) = &self.upstream {
                upstream.relay(datagram);
            }
        }
        Ok(())
    }

    fn handle_control(
        &self,
        origin: Option<ParticipantId>,
        dgi: &mut DatagramIterator,
    ) -> Result<(), DirectorError> {
        let id = origin.ok_or(DirectorError::ControlWithoutOrigin)?;
        let msg_type = dgi.read_u16()?;
        let control =
            ControlMessage::try_from(msg_type).map_err(ProtocolError::UnknownControlMessage)?;
        trace!(participant = id, ?control, "Control message");

        match control {
            ControlMessage::AddChannel => {
                let channel = dgi.read_channel()?;
                self.subscribe_channel(id, channel)
            }
            ControlMessage::RemoveChannel => {
                let channel = dgi.read_channel()?;
                self.unsubscribe_channel(id, channel)
            }
            ControlMessage::AddRange => {
                let min = dgi.read_channel()?;
                let max = dgi.read_channel()?;
                self.subscribe_range(id, Range::new(min, max)?)
            }
            ControlMessage::RemoveRange => {
                let min = dgi.read_channel()?;
                let max = dgi.read_channel()?;
                self.unsubscribe_range(id, Range::new(min, max)?)
            }
            ControlMessage::AddPostRemove => {
                let channel = dgi.read_channel()?;
                let datagram = dgi.read_datagram()?;
                self.add_post_remove(id, channel, datagram)
            }
            ControlMessage::ClearPostRemoves => {
                let channel = dgi.read_channel()?;
                self.clear_post_removes(id, channel)
            }
            ControlMessage::SetConName => {
                let name = dgi.read_string()?;
                self.set_name(id, name)
            }
            ControlMessage::SetConUrl => {
                let url = dgi.read_string()?;
                self.set_url(id, url)
            }
        }
    }

    /// Deliver `datagram` to every subscriber of any recipient, at most once
    /// each, never back to `origin`.
    async fn route(&self, recipients: &[Channel], datagram: &Bytes, origin: Option<ParticipantId>) {
        let mut unique = recipients.to_vec();
        unique.sort_unstable();
        unique.dedup();

        if let [channel] = unique[..] {
            let ranges = self.ranges();
            self.channels.deliver(channel, datagram.clone(), origin);
            ranges.send(channel, datagram, origin);
            return;
        }

        // Snapshot range subscribers and queue unit lookups under one lock so
        // the two views agree.
        let mut targets: HashMap<ParticipantId, Arc<dyn Participant>> = HashMap::new();
        let pending: Vec<_> = {
            let ranges = self.ranges();
            for channel in &unique {
                for participant in ranges.resolve(*channel) {
                    targets.insert(participant.id(), Arc::clone(participant));
                }
            }
            unique
                .iter()
                .filter_map(|channel| self.channels.resolve(*channel))
                .collect()
        };

        for subscribers in join_all(pending).await {
            for participant in subscribers {
                targets.insert(participant.id(), participant);
            }
        }

        if let Some(origin) = origin {
            targets.remove(&origin);
        }
        trace!(recipients = unique.len(), targets = targets.len(), "Routing datagram");
        for participant in targets.into_values() {
            participant.deliver(datagram.clone());
        }
    }

    /// Drop a participant from inside the dispatch loop.
    ///
    /// Post-removes are routed immediately instead of being queued, since
    /// the loop cannot wait on its own queue.
    async fn disconnect(&self, id: ParticipantId, reason: &str) {
        let Some(detached) = self.detach(id) else {
            return;
        };
        detached.participant.terminate(reason);

        for (channel, datagrams) in detached.post_removes {
            for datagram in datagrams {
                if let Err(err) = self.handle(datagram, Some(id)).await {
                    warn!(participant = id, error = %err, "Dropping malformed post-remove");
                }
            }
            if let Some(upstream) = &self.upstream {
                upstream.clear_post_removes(channel);
            }
        }
    }
}

impl std::fmt::Debug for MessageDirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDirector")
            .field("participants", &self.participants.len())
            .field("channels", &self.channels)
            .field("upstream", &self.upstream.is_some())
            .finish()
    }
}

async fn dispatch_loop(director: Weak<MessageDirector>, mut queue: mpsc::Receiver<Inbound>) {
    while let Some(inbound) = queue.recv().await {
        let Some(director) = director.upgrade() else {
            break;
        };
        match inbound {
            Inbound::Datagram { datagram, origin } => director.process(datagram, origin).await,
            Inbound::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::ParticipantBase;
    use crate::testing::RecordingParticipant;
    use astron_protocol::msgtypes::*;
    use astron_protocol::Datagram;

    fn director() -> Arc<MessageDirector> {
        MessageDirector::start(DirectorConfig::default(), None)
    }

    fn federated() -> (Arc<MessageDirector>, mpsc::UnboundedReceiver<Bytes>) {
        let (link, rx) = UpstreamLink::new();
        (MessageDirector::start(DirectorConfig::default(), Some(link)), rx)
    }

    fn message(to: &[Channel], from: Channel) -> Bytes {
        let mut dg = Datagram::new();
        dg.add_multiple_server_header(to, from, 1234).add_u32(0xDEAD_BEEF);
        dg.freeze()
    }

    fn control(msg_type: u16, channels: &[Channel]) -> Bytes {
        let mut dg = Datagram::new();
        dg.add_control_header(msg_type);
        for ch in channels {
            dg.add_channel(*ch);
        }
        dg.freeze()
    }

    /// Decode queued upstream control traffic as `(type, args)` pairs.
    fn drain_upstream(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<(u16, Vec<Channel>)> {
        let mut out = Vec::new();
        while let Ok(dg) = rx.try_recv() {
            let mut dgi = DatagramIterator::new(dg);
            let recipients = dgi.recipients().unwrap();
            if recipients != [CONTROL_MESSAGE] {
                out.push((0, recipients));
                continue;
            }
            let msg_type = dgi.read_u16().unwrap();
            let mut args = Vec::new();
            while dgi.remaining() >= 8 {
                args.push(dgi.read_channel().unwrap());
            }
            out.push((msg_type, args));
        }
        out
    }

    /// What a subscriber receives for `dg`: everything after the recipients.
    fn delivered(dg: &Bytes) -> Bytes {
        let mut dgi = DatagramIterator::new(dg.clone());
        dgi.recipients().unwrap();
        dg.slice(dgi.tell()..)
    }

    async fn send(md: &MessageDirector, origin: ParticipantId, dg: Bytes) {
        md.receive_inbound(Some(origin), dg).await.unwrap();
    }

    #[tokio::test]
    async fn test_discrete_routing() {
        let md = director();
        let (a, mut inbox_a) = RecordingParticipant::attach(&md);
        let (b, mut inbox_b) = RecordingParticipant::attach(&md);

        md.subscribe_channel(a.id(), 5000).unwrap();
        let dg = message(&[5000], 77);
        send(&md, b.id(), dg.clone()).await;

        let received = inbox_a.expect().await;
        assert_eq!(received, delivered(&dg));
        let mut dgi = DatagramIterator::new(received);
        assert_eq!(dgi.read_channel().unwrap(), 77);
        assert_eq!(dgi.read_u16().unwrap(), 1234);
        assert_eq!(dgi.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(dgi.remaining(), 0);
        inbox_b.expect_none().await;
    }

    #[tokio::test]
    async fn test_control_messages_subscribe() {
        let md = director();
        let (a, mut inbox_a) = RecordingParticipant::attach(&md);
        let (b, _inbox_b) = RecordingParticipant::attach(&md);

        send(&md, a.id(), control(CONTROL_ADD_CHANNEL, &[100])).await;
        send(&md, a.id(), control(CONTROL_ADD_RANGE, &[200, 300])).await;
        md.sync().await.unwrap();
        assert_eq!(md.channels_of(a.id()), vec![100]);
        assert_eq!(md.ranges_of(a.id()), vec![Range::new(200, 300).unwrap()]);

        let first = message(&[100], 1);
        let second = message(&[250], 2);
        send(&md, b.id(), first.clone()).await;
        send(&md, b.id(), second.clone()).await;
        let mut got = inbox_a.drain().await;
        got.sort();
        let mut want = vec![delivered(&first), delivered(&second)];
        want.sort();
        assert_eq!(got, want);

        send(&md, a.id(), control(CONTROL_REMOVE_CHANNEL, &[100])).await;
        send(&md, a.id(), control(CONTROL_REMOVE_RANGE, &[200, 300])).await;
        send(&md, b.id(), message(&[100, 250], 3)).await;
        md.sync().await.unwrap();
        inbox_a.expect_none().await;
        assert_eq!(md.stats().channels, 0);
        assert_eq!(md.stats().range_intervals, 0);
    }

    #[tokio::test]
    async fn test_multi_recipient_delivers_once() {
        let md = director();
        let (a, mut inbox_a) = RecordingParticipant::attach(&md);
        let (b, mut inbox_b) = RecordingParticipant::attach(&md);
        let (c, mut inbox_c) = RecordingParticipant::attach(&md);

        md.subscribe_channel(a.id(), 10).unwrap();
        md.subscribe_channel(a.id(), 20).unwrap();
        md.subscribe_range(b.id(), Range::new(15, 30).unwrap()).unwrap();

        let dg = message(&[10, 20, 20, 25], 99);
        send(&md, c.id(), dg.clone()).await;

        assert_eq!(inbox_a.drain().await, vec![delivered(&dg)]);
        assert_eq!(inbox_b.drain().await, vec![delivered(&dg)]);
        inbox_c.expect_none().await;
    }

    #[tokio::test]
    async fn test_no_echo_to_origin() {
        let md = director();
        let (a, mut inbox_a) = RecordingParticipant::attach(&md);
        let (b, mut inbox_b) = RecordingParticipant::attach(&md);

        md.subscribe_channel(a.id(), 42).unwrap();
        md.subscribe_range(b.id(), Range::new(40, 50).unwrap()).unwrap();

        send(&md, a.id(), message(&[42], 0)).await;
        send(&md, a.id(), message(&[42, 43], 0)).await;

        assert_eq!(inbox_b.drain().await.len(), 2);
        inbox_a.expect_none().await;
    }

    #[tokio::test]
    async fn test_range_and_discrete_are_exclusive() {
        let md = director();
        let (a, mut inbox_a) = RecordingParticipant::attach(&md);
        let (b, _inbox_b) = RecordingParticipant::attach(&md);

        md.subscribe_channel(a.id(), 150).unwrap();
        md.subscribe_range(a.id(), Range::new(100, 200).unwrap()).unwrap();
        assert!(md.channels_of(a.id()).is_empty());

        // Already covered by the range.
        md.subscribe_channel(a.id(), 160).unwrap();
        assert!(md.channels_of(a.id()).is_empty());

        send(&md, b.id(), message(&[150], 0)).await;
        assert_eq!(inbox_a.drain().await.len(), 1);

        // Removing a discrete subscription that only exists via the range is a no-op.
        md.unsubscribe_channel(a.id(), 150).unwrap();
        send(&md, b.id(), message(&[150], 0)).await;
        assert_eq!(inbox_a.drain().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_range_drops_discrete_channels_inside() {
        let md = director();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);

        md.subscribe_channel(a.id(), 5).unwrap();
        md.subscribe_channel(a.id(), 500).unwrap();
        md.unsubscribe_range(a.id(), Range::new(0, 100).unwrap()).unwrap();
        assert_eq!(md.channels_of(a.id()), vec![500]);
    }

    #[tokio::test]
    async fn test_split_ranges_route_correctly() {
        let md = director();
        let (a, mut inbox_a) = RecordingParticipant::attach(&md);
        let (b, mut inbox_b) = RecordingParticipant::attach(&md);
        let (c, _inbox_c) = RecordingParticipant::attach(&md);

        md.subscribe_range(a.id(), Range::new(100, 600).unwrap()).unwrap();
        md.subscribe_range(b.id(), Range::new(580, 700).unwrap()).unwrap();

        send(&md, c.id(), message(&[585], 0)).await;
        assert_eq!(inbox_a.drain().await.len(), 1);
        assert_eq!(inbox_b.drain().await.len(), 1);

        md.unsubscribe_range(a.id(), Range::new(590, 650).unwrap()).unwrap();

        send(&md, c.id(), message(&[620], 0)).await;
        inbox_a.expect_none().await;
        assert_eq!(inbox_b.drain().await.len(), 1);

        send(&md, c.id(), message(&[585], 0)).await;
        assert_eq!(inbox_a.drain().await.len(), 1);
        assert_eq!(inbox_b.drain().await.len(), 1);

        send(&md, c.id(), message(&[595], 0)).await;
        inbox_a.expect_none().await;
        assert_eq!(inbox_b.drain().await.len(), 1);

        send(&md, c.id(), message(&[300], 0)).await;
        assert_eq!(inbox_a.drain().await.len(), 1);
        inbox_b.expect_none().await;

        assert_eq!(
            md.ranges_of(a.id()),
            vec![Range::new(100, 589).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_repeated_recipients_deliver_once() {
        let md = director();
        let (p1, mut inbox_1) = RecordingParticipant::attach(&md);
        let (p2, mut inbox_2) = RecordingParticipant::attach(&md);
        let (sender, mut inbox_sender) = RecordingParticipant::attach(&md);

        md.subscribe_channel(p1.id(), 1111).unwrap();
        md.subscribe_channel(p1.id(), 2222).unwrap();
        md.subscribe_channel(p2.id(), 2222).unwrap();
        md.subscribe_channel(p2.id(), 3333).unwrap();

        let dg = message(
            &[1111, 2222, 3333, 1111, 1111, 2222, 3333, 3333, 2222],
            sender.id(),
        );
        send(&md, sender.id(), dg.clone()).await;

        assert_eq!(inbox_1.drain().await, vec![delivered(&dg)]);
        assert_eq!(inbox_2.drain().await, vec![delivered(&dg)]);
        inbox_sender.expect_none().await;
    }

    #[tokio::test]
    async fn test_post_remove_fires_on_terminate() {
        let md = director();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);
        let (b, mut inbox_b) = RecordingParticipant::attach(&md);
        md.subscribe_channel(b.id(), 10000).unwrap();

        let goodbye = message(&[10000], 1);
        let mut dg = Datagram::new();
        dg.add_control_header(CONTROL_ADD_POST_REMOVE)
            .add_channel(10000)
            .add_datagram(&goodbye);
        send(&md, a.id(), dg.freeze()).await;
        md.sync().await.unwrap();

        md.terminate_participant(a.id()).await.unwrap();
        assert_eq!(inbox_b.expect().await, delivered(&goodbye));

        // A second terminate does not fire again.
        md.terminate_participant(a.id()).await.unwrap();
        inbox_b.expect_none().await;
        assert!(!md.is_registered(a.id()));
    }

    #[tokio::test]
    async fn test_cleared_post_removes_do_not_fire() {
        let md = director();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);
        let (b, mut inbox_b) = RecordingParticipant::attach(&md);
        md.subscribe_channel(b.id(), 10000).unwrap();

        md.add_post_remove(a.id(), 77, message(&[10000], 1)).unwrap();
        md.add_post_remove(a.id(), 78, message(&[10000], 2)).unwrap();
        md.clear_post_removes(a.id(), 77).unwrap();

        md.terminate_participant(a.id()).await.unwrap();
        let fired = inbox_b.drain().await;
        assert_eq!(fired, vec![delivered(&message(&[10000], 2))]);
    }

    #[tokio::test]
    async fn test_malformed_datagram_disconnects_sender() {
        let md = director();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);
        let (b, mut inbox_b) = RecordingParticipant::attach(&md);
        md.subscribe_channel(a.id(), 1).unwrap();
        md.subscribe_channel(b.id(), 300).unwrap();
        md.add_post_remove(a.id(), 5, message(&[300], 5)).unwrap();

        // Claims three recipients but carries one.
        let mut dg = Datagram::new();
        dg.add_u8(3).add_channel(1);
        send(&md, a.id(), dg.freeze()).await;
        md.sync().await.unwrap();

        assert!(!md.is_registered(a.id()));
        assert_eq!(a.terminations().len(), 1);
        assert_eq!(inbox_b.expect().await, delivered(&message(&[300], 5)));
        assert_eq!(md.stats().channels, 1);
    }

    #[tokio::test]
    async fn test_inverted_range_disconnects_sender() {
        let md = director();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);

        send(&md, a.id(), control(CONTROL_ADD_RANGE, &[300, 200])).await;
        md.sync().await.unwrap();
        assert!(!md.is_registered(a.id()));
        assert_eq!(md.stats().range_intervals, 0);
    }

    #[tokio::test]
    async fn test_unknown_control_disconnects_sender() {
        let md = director();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);

        send(&md, a.id(), control(9999, &[])).await;
        md.sync().await.unwrap();
        assert!(!md.is_registered(a.id()));
    }

    #[tokio::test]
    async fn test_connection_name_and_url() {
        let md = director();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);

        let mut dg = Datagram::new();
        dg.add_control_header(CONTROL_SET_CON_NAME).add_string("stateserver");
        send(&md, a.id(), dg.freeze()).await;
        let mut dg = Datagram::new();
        dg.add_control_header(CONTROL_SET_CON_URL).add_string("tcp://10.0.0.4:7199");
        send(&md, a.id(), dg.freeze()).await;
        md.sync().await.unwrap();

        assert_eq!(md.name_of(a.id()).as_deref(), Some("stateserver"));
        assert_eq!(md.url_of(a.id()).as_deref(), Some("tcp://10.0.0.4:7199"));
    }

    #[tokio::test]
    async fn test_upstream_traffic_is_routed_not_relayed() {
        let (md, mut upstream) = federated();
        let (a, mut inbox_a) = RecordingParticipant::attach(&md);
        md.subscribe_channel(a.id(), 4000).unwrap();
        drain_upstream(&mut upstream);

        let dg = message(&[4000], 9);
        md.receive_from_upstream(dg.clone()).await.unwrap();
        assert_eq!(inbox_a.expect().await, delivered(&dg));
        md.sync().await.unwrap();
        assert!(drain_upstream(&mut upstream).is_empty());

        // Control traffic from the parent is ignored.
        md.receive_from_upstream(control(CONTROL_ADD_CHANNEL, &[1])).await.unwrap();
        md.sync().await.unwrap();
        assert_eq!(md.stats().channels, 1);
    }

    #[tokio::test]
    async fn test_local_traffic_is_relayed_upstream() {
        let (md, mut upstream) = federated();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);

        let dg = message(&[123, 456], 9);
        send(&md, a.id(), dg.clone()).await;
        md.sync().await.unwrap();

        let relayed = drain_upstream(&mut upstream);
        assert_eq!(relayed, vec![(0, vec![123, 456])]);
    }

    #[tokio::test]
    async fn test_upstream_mirrors_channel_transitions() {
        let (md, mut upstream) = federated();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);
        let (b, _inbox_b) = RecordingParticipant::attach(&md);

        md.subscribe_channel(a.id(), 77).unwrap();
        md.subscribe_channel(b.id(), 77).unwrap();
        md.unsubscribe_channel(a.id(), 77).unwrap();
        md.unsubscribe_channel(b.id(), 77).unwrap();

        assert_eq!(
            drain_upstream(&mut upstream),
            vec![
                (CONTROL_ADD_CHANNEL, vec![77]),
                (CONTROL_REMOVE_CHANNEL, vec![77]),
            ]
        );
    }

    #[tokio::test]
    async fn test_upstream_mirrors_range_coverage() {
        let (md, mut upstream) = federated();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);
        let (b, _inbox_b) = RecordingParticipant::attach(&md);

        md.subscribe_range(a.id(), Range::new(100, 600).unwrap()).unwrap();
        md.subscribe_range(b.id(), Range::new(580, 700).unwrap()).unwrap();
        assert_eq!(
            drain_upstream(&mut upstream),
            vec![
                (CONTROL_ADD_RANGE, vec![100, 600]),
                (CONTROL_ADD_RANGE, vec![601, 700]),
            ]
        );

        md.unsubscribe_range(b.id(), Range::new(590, 650).unwrap()).unwrap();
        assert_eq!(
            drain_upstream(&mut upstream),
            vec![(CONTROL_REMOVE_RANGE, vec![601, 650])]
        );

        md.terminate_participant(a.id()).await.unwrap();
        assert_eq!(
            drain_upstream(&mut upstream),
            vec![
                (CONTROL_REMOVE_RANGE, vec![100, 579]),
                (CONTROL_REMOVE_RANGE, vec![590, 600]),
            ]
        );
    }

    #[tokio::test]
    async fn test_uncovered_range_reannounces_discrete_channels() {
        let (md, mut upstream) = federated();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);
        let (b, _inbox_b) = RecordingParticipant::attach(&md);

        md.subscribe_channel(a.id(), 150).unwrap();
        md.subscribe_range(b.id(), Range::new(100, 200).unwrap()).unwrap();
        drain_upstream(&mut upstream);

        md.unsubscribe_range(b.id(), Range::new(100, 200).unwrap()).unwrap();
        assert_eq!(
            drain_upstream(&mut upstream),
            vec![
                (CONTROL_REMOVE_RANGE, vec![100, 200]),
                (CONTROL_ADD_CHANNEL, vec![150]),
            ]
        );
    }

    #[tokio::test]
    async fn test_post_removes_mirrored_upstream() {
        let (md, mut upstream) = federated();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);

        md.add_post_remove(a.id(), 31, message(&[5], 31)).unwrap();
        let mirrored = drain_upstream(&mut upstream);
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].0, CONTROL_ADD_POST_REMOVE);

        md.terminate_participant(a.id()).await.unwrap();
        md.sync().await.unwrap();
        let after = drain_upstream(&mut upstream);
        assert!(after.contains(&(CONTROL_CLEAR_POST_REMOVES, vec![31])));
        // The fired datagram is relayed like any local traffic.
        assert!(after.contains(&(0, vec![5])));
    }

    #[tokio::test]
    async fn test_participant_base_round_trip() {
        let md = director();
        let base = ParticipantBase::new(md.clone());
        let (role, mut inbox) = RecordingParticipant::new(base.id());
        md.register(role);
        let (other, _other_inbox) = RecordingParticipant::attach(&md);

        base.subscribe_range(1000, 1999).unwrap();
        assert!(base.subscribe_range(10, 1).is_err());

        send(&md, other.id(), message(&[1500], 0)).await;
        assert_eq!(inbox.drain().await.len(), 1);

        base.receive_inbound(message(&[1500], 0)).await.unwrap();
        inbox.expect_none().await;

        base.terminate().await.unwrap();
        base.terminate().await.unwrap();
        assert!(!md.is_registered(base.id()));
        assert!(matches!(
            base.subscribe_channel(1),
            Err(DirectorError::UnknownParticipant(_))
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let md = director();
        let (a, _inbox_a) = RecordingParticipant::attach(&md);
        let (b, _inbox_b) = RecordingParticipant::attach(&md);

        md.subscribe_channel(a.id(), 1).unwrap();
        md.subscribe_channel(b.id(), 1).unwrap();
        md.subscribe_channel(b.id(), 2).unwrap();
        md.subscribe_range(a.id(), Range::new(10, 20).unwrap()).unwrap();

        let stats = md.stats();
        assert_eq!(stats.participants, 2);
        assert_eq!(stats.channels, 2);
        assert_eq!(stats.range_intervals, 1);
        assert_eq!(stats.range_subscribers, 1);
        assert!(!stats.upstream);
    }
}
