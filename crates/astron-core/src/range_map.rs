//! Interval table for range subscriptions.
//!
//! Stored intervals never overlap. Each carries the set of participants
//! subscribed to every channel inside it, so delivering to a channel means
//! finding the one interval that covers it. Adding or removing a range splits
//! existing intervals at the new boundaries until every stored interval is
//! either entirely inside or entirely outside the range.

use crate::participant::{Participant, ParticipantId};
use astron_protocol::Channel;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("Inverted channel range [{min}, {max}]")]
    Inverted { min: Channel, max: Channel },
}

/// An inclusive channel range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Range {
    pub min: Channel,
    pub max: Channel,
}

impl Range {
    /// # Errors
    ///
    /// Returns [`RangeError::Inverted`] if `min > max`.
    pub fn new(min: Channel, max: Channel) -> Result<Self, RangeError> {
        if min > max {
            return Err(RangeError::Inverted { min, max });
        }
        Ok(Self { min, max })
    }

    #[must_use]
    pub fn single(channel: Channel) -> Self {
        Self {
            min: channel,
            max: channel,
        }
    }

    #[must_use]
    pub fn contains(&self, channel: Channel) -> bool {
        self.min <= channel && channel <= self.max
    }

    #[must_use]
    pub fn overlaps(&self, other: &Range) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    #[must_use]
    pub fn encloses(&self, other: &Range) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    #[must_use]
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        self.overlaps(other).then(|| Range {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        })
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Coverage changes produced by an add or remove.
///
/// `added` holds portions that went from no subscribers to at least one;
/// `removed` holds portions that lost their last subscriber. Adjacent pieces
/// are merged.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RangeChange {
    pub added: Vec<Range>,
    pub removed: Vec<Range>,
}

impl RangeChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    fn coalesce(&mut self) {
        self.added = coalesce(std::mem::take(&mut self.added));
        self.removed = coalesce(std::mem::take(&mut self.removed));
    }
}

fn coalesce(mut ranges: Vec<Range>) -> Vec<Range> {
    ranges.sort_unstable();
    let mut out: Vec<Range> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match out.last_mut() {
            Some(last) if last.max.checked_add(1) == Some(r.min) => last.max = r.max,
            _ => out.push(r),
        }
    }
    out
}

#[derive(Debug, Clone)]
struct Interval {
    max: Channel,
    subscribers: HashSet<ParticipantId>,
}

struct RangeSubscriber {
    participant: Arc<dyn Participant>,
    intervals: BTreeSet<Range>,
}

/// Disjoint interval table plus a reverse index from participant to the
/// intervals it belongs to.
#[derive(Default)]
pub struct RangeMap {
    /// Keyed by interval minimum.
    intervals: BTreeMap<Channel, Interval>,
    subscribers: HashMap<ParticipantId, RangeSubscriber>,
}

impl RangeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `participant` to every channel in `range`.
    pub fn add(&mut self, range: Range, participant: &Arc<dyn Participant>) -> RangeChange {
        let id = participant.id();
        self.subscribers
            .entry(id)
            .or_insert_with(|| RangeSubscriber {
                participant: Arc::clone(participant),
                intervals: BTreeSet::new(),
            });

        let mut change = RangeChange::default();
        self.add_inner(range, id, &mut change);
        change.coalesce();
        change
    }

    fn add_inner(&mut self, range: Range, id: ParticipantId, change: &mut RangeChange) {
        let mut pending = vec![range];
        while let Some(range) = pending.pop() {
            let Some(existing) = self.first_overlap(range) else {
                self.insert(range, HashSet::from([id]));
                change.added.push(range);
                continue;
            };

            if existing == range {
                self.attach(existing, id);
            } else if range.encloses(&existing) {
                self.attach(existing, id);
                if range.min < existing.min {
                    pending.push(Range { min: range.min, max: existing.min - 1 });
                }
                if existing.max < range.max {
                    pending.push(Range { min: existing.max + 1, max: range.max });
                }
            } else if existing.encloses(&range) {
                let inside = self.isolate(existing, range);
                self.attach(inside, id);
            } else if existing.min < range.min {
                // Existing interval hangs off the low end.
                let inside = self.isolate(existing, Range { min: range.min, max: existing.max });
                self.attach(inside, id);
                pending.push(Range { min: existing.max + 1, max: range.max });
            } else {
                // Existing interval hangs off the high end.
                let inside = self.isolate(existing, Range { min: existing.min, max: range.max });
                self.attach(inside, id);
                pending.push(Range { min: range.min, max: existing.min - 1 });
            }
        }
    }

    /// Unsubscribe participant `id` from every channel in `range`.
    ///
    /// Portions the participant was not subscribed to are ignored.
    pub fn remove(&mut self, range: Range, id: ParticipantId) -> RangeChange {
        let mut change = RangeChange::default();
        if !self.subscribers.contains_key(&id) {
            return change;
        }

        self.remove_inner(range, id, &mut change);
        self.forget_if_empty(id);
        change.coalesce();
        change
    }

    fn remove_inner(&mut self, range: Range, id: ParticipantId, change: &mut RangeChange) {
        let mut pending = vec![range];
        while let Some(range) = pending.pop() {
            let Some(existing) = self.first_overlap(range) else {
                continue;
            };

            let subscribed = self
                .intervals
                .get(&existing.min)
                .is_some_and(|iv| iv.subscribers.contains(&id));
            if subscribed {
                if let Some(overlap) = existing.intersection(&range) {
                    let inside = self.isolate(existing, overlap);
                    self.detach(inside, id, change);
                }
            }

            if range.min < existing.min {
                pending.push(Range { min: range.min, max: existing.min - 1 });
            }
            if existing.max < range.max {
                pending.push(Range { min: existing.max + 1, max: range.max });
            }
        }
    }

    /// Drop every range held by `id`.
    pub fn remove_subscriber(&mut self, id: ParticipantId) -> RangeChange {
        let mut change = RangeChange::default();
        let Some(sub) = self.subscribers.remove(&id) else {
            return change;
        };

        for range in sub.intervals {
            let emptied = match self.intervals.get_mut(&range.min) {
                Some(iv) => {
                    iv.subscribers.remove(&id);
                    iv.subscribers.is_empty()
                }
                None => false,
            };
            if emptied {
                self.intervals.remove(&range.min);
                change.removed.push(range);
            }
        }

        change.coalesce();
        change
    }

    /// Deliver `datagram` to every range subscriber covering `channel`,
    /// skipping `exclude`. Returns the number of deliveries.
    pub fn send(&self, channel: Channel, datagram: &Bytes, exclude: Option<ParticipantId>) -> usize {
        let Some(iv) = self.covering(channel) else {
            return 0;
        };

        let mut delivered = 0;
        for id in &iv.subscribers {
            if Some(*id) == exclude {
                continue;
            }
            if let Some(sub) = self.subscribers.get(id) {
                sub.participant.deliver(datagram.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Participants whose ranges cover `channel`.
    pub fn resolve(&self, channel: Channel) -> impl Iterator<Item = &Arc<dyn Participant>> + '_ {
        self.covering(channel)
            .into_iter()
            .flat_map(|iv| iv.subscribers.iter())
            .filter_map(move |id| self.subscribers.get(id).map(|sub| &sub.participant))
    }

    /// Whether `id` holds a range covering `channel`.
    #[must_use]
    pub fn covers(&self, id: ParticipantId, channel: Channel) -> bool {
        self.covering(channel)
            .is_some_and(|iv| iv.subscribers.contains(&id))
    }

    /// The ranges `id` is subscribed to, merged where adjacent.
    #[must_use]
    pub fn ranges_of(&self, id: ParticipantId) -> Vec<Range> {
        self.subscribers
            .get(&id)
            .map(|sub| coalesce(sub.intervals.iter().copied().collect()))
            .unwrap_or_default()
    }

    /// Sorted ids subscribed at `channel`.
    #[must_use]
    pub fn subscribers_at(&self, channel: Channel) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self
            .covering(channel)
            .map(|iv| iv.subscribers.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Stored intervals in ascending order.
    pub fn intervals(&self) -> impl Iterator<Item = Range> + '_ {
        self.intervals
            .iter()
            .map(|(min, iv)| Range { min: *min, max: iv.max })
    }

    #[must_use]
    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    fn covering(&self, channel: Channel) -> Option<&Interval> {
        self.intervals
            .range(..=channel)
            .next_back()
            .map(|(_, iv)| iv)
            .filter(|iv| iv.max >= channel)
    }

    /// Some stored interval overlapping `range`.
    ///
    /// Intervals are disjoint and sorted, so if the last one starting at or
    /// below `range.max` ends before `range.min`, nothing overlaps.
    fn first_overlap(&self, range: Range) -> Option<Range> {
        self.intervals
            .range(..=range.max)
            .next_back()
            .filter(|(_, iv)| iv.max >= range.min)
            .map(|(min, iv)| Range { min: *min, max: iv.max })
    }

    fn insert(&mut self, range: Range, subscribers: HashSet<ParticipantId>) {
        for id in &subscribers {
            if let Some(sub) = self.subscribers.get_mut(id) {
                sub.intervals.insert(range);
            }
        }
        self.intervals.insert(
            range.min,
            Interval {
                max: range.max,
                subscribers,
            },
        );
    }

    /// Split stored interval `existing` so that `inner` becomes its own
    /// interval with the same subscribers. Returns `inner`.
    fn isolate(&mut self, existing: Range, inner: Range) -> Range {
        if existing == inner {
            return inner;
        }
        let Some(iv) = self.intervals.remove(&existing.min) else {
            return inner;
        };
        for id in &iv.subscribers {
            if let Some(sub) = self.subscribers.get_mut(id) {
                sub.intervals.remove(&existing);
            }
        }

        if existing.min < inner.min {
            self.insert(
                Range { min: existing.min, max: inner.min - 1 },
                iv.subscribers.clone(),
            );
        }
        if inner.max < existing.max {
            self.insert(
                Range { min: inner.max + 1, max: existing.max },
                iv.subscribers.clone(),
            );
        }
        self.insert(inner, iv.subscribers);
        inner
    }

    fn attach(&mut self, range: Range, id: ParticipantId) {
        if let Some(iv) = self.intervals.get_mut(&range.min) {
            iv.subscribers.insert(id);
        }
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.intervals.insert(range);
        }
    }

    fn detach(&mut self, range: Range, id: ParticipantId, change: &mut RangeChange) {
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.intervals.remove(&range);
        }
        let emptied = match self.intervals.get_mut(&range.min) {
            Some(iv) => {
                iv.subscribers.remove(&id);
                iv.subscribers.is_empty()
            }
            None => false,
        };
        if emptied {
            self.intervals.remove(&range.min);
            change.removed.push(range);
        }
    }

    fn forget_if_empty(&mut self, id: ParticipantId) {
        if self
            .subscribers
            .get(&id)
            .is_some_and(|sub| sub.intervals.is_empty())
        {
            self.subscribers.remove(&id);
        }
    }
}

impl std::fmt::Debug for RangeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeMap")
            .field("intervals", &self.intervals.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
