//! Restores per-room event order on the receiving node.
//!
//! Nodes take a revision from the store and then publish, so two events can reach the
//! bus in the opposite order to their revisions, and a redelivered event can show up
//! twice. The sequencer releases events strictly by revision, drops anything already
//! released, and gives up on a missing revision once it has been waited for longer than
//! the reorder window. Events without a revision are released as soon as they arrive.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::bus::RoomEnvelope;

#[derive(Debug)]
pub struct Sequencer {
    room: String,
    window: Duration,
    /// Last revision released; `None` until the joining snapshot sets it.
    released: Option<u64>,
    pending: BTreeMap<u64, RoomEnvelope>,
    gap_since: Option<Instant>,
}

impl Sequencer {
    pub fn new(room: impl Into<String>, window: Duration) -> Self {
        Self {
            room: room.into(),
            window,
            released: None,
            pending: BTreeMap::new(),
            gap_since: None,
        }
    }

    pub fn released(&self) -> Option<u64> {
        self.released
    }

    /// Start releasing after `revision`. Only the first call has an effect.
    pub fn set_base(&mut self, revision: u64, now: Instant) -> Vec<RoomEnvelope> {
        if self.released.is_some() {
            return Vec::new();
        }
        self.released = Some(revision);
        self.pending = self.pending.split_off(&(revision + 1));
        self.drain(now)
    }

    /// Accept an envelope from the bus and return whatever is now deliverable.
    pub fn push(&mut self, envelope: RoomEnvelope, now: Instant) -> Vec<RoomEnvelope> {
        let Some(revision) = envelope.revision else {
            return vec![envelope];
        };
        if self.released.map(|released| revision <= released).unwrap_or(false) {
            return Vec::new();
        }
        self.pending.insert(revision, envelope);
        match self.released {
            Some(_) => self.drain(now),
            None => Vec::new(),
        }
    }

    /// When the current gap should be given up on.
    pub fn deadline(&self) -> Option<Instant> {
        self.gap_since.map(|since| since + self.window)
    }

    /// Skip past an expired gap. Returns the skipped count and the released envelopes.
    pub fn expire(&mut self, now: Instant) -> (u64, Vec<RoomEnvelope>) {
        let (Some(deadline), Some(released)) = (self.deadline(), self.released) else {
            return (0, Vec::new());
        };
        if now < deadline {
            return (0, Vec::new());
        }
        let Some(&next) = self.pending.keys().next() else {
            self.gap_since = None;
            return (0, Vec::new());
        };
        let skipped = next.saturating_sub(released + 1);
        warn!(
            room = %self.room,
            from = released + 1,
            to = next - 1,
            "giving up on missing room events"
        );
        self.released = Some(next - 1);
        (skipped, self.drain(now))
    }

    fn drain(&mut self, now: Instant) -> Vec<RoomEnvelope> {
        let mut ready = Vec::new();
        let Some(mut released) = self.released else {
            return ready;
        };
        while let Some(envelope) = self.pending.remove(&(released + 1)) {
            released += 1;
            ready.push(envelope);
        }
        self.released = Some(released);
        self.gap_since = if self.pending.is_empty() {
            None
        } else if !ready.is_empty() {
            Some(now)
        } else {
            Some(self.gap_since.unwrap_or(now))
        };
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;
    use serde_json::json;

    fn update(revision: u64) -> RoomEnvelope {
        RoomEnvelope {
            room: "r".into(),
            exclude: None,
            revision: Some(revision),
            event: ServerEvent::Update {
                room: "r".into(),
                connection: "c".into(),
                field: "f".into(),
                changes: json!(revision),
                order: revision,
            },
        }
    }

    fn discard(revision: u64) -> RoomEnvelope {
        RoomEnvelope {
            room: "r".into(),
            exclude: None,
            revision: Some(revision),
            event: ServerEvent::Discard {
                room: "r".into(),
                fields: vec!["f".into()],
            },
        }
    }

    fn revisions(envelopes: &[RoomEnvelope]) -> Vec<u64> {
        envelopes
            .iter()
            .filter_map(|envelope| envelope.revision)
            .collect()
    }

    #[test_timeout::timeout]
    fn releases_out_of_order_updates_contiguously() {
        let now = Instant::now();
        let mut sequencer = Sequencer::new("r", Duration::from_millis(500));
        assert!(sequencer.set_base(0, now).is_empty());
        assert!(sequencer.push(update(2), now).is_empty());
        assert!(sequencer.push(update(3), now).is_empty());
        assert_eq!(revisions(&sequencer.push(update(1), now)), vec![1, 2, 3]);
        assert_eq!(sequencer.released(), Some(3));
        assert_eq!(sequencer.deadline(), None);
    }

    #[test_timeout::timeout]
    fn discard_waits_behind_the_update_it_follows() {
        let now = Instant::now();
        let mut sequencer = Sequencer::new("r", Duration::from_millis(500));
        sequencer.set_base(0, now);
        assert!(sequencer.push(update(2), now).is_empty());
        assert!(sequencer.push(discard(3), now).is_empty());
        let released = sequencer.push(update(1), now);
        let kinds: Vec<&str> = released
            .iter()
            .map(|envelope| match envelope.event {
                ServerEvent::Update { .. } => "update",
                ServerEvent::Discard { .. } => "discard",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["update", "update", "discard"]);
        assert_eq!(revisions(&released), vec![1, 2, 3]);
    }

    #[test_timeout::timeout]
    fn duplicates_are_dropped() {
        let now = Instant::now();
        let mut sequencer = Sequencer::new("r", Duration::from_millis(500));
        sequencer.set_base(0, now);
        assert_eq!(revisions(&sequencer.push(update(1), now)), vec![1]);
        assert!(sequencer.push(update(1), now).is_empty());
    }

    #[test_timeout::timeout]
    fn buffers_until_based_and_drops_covered_revisions() {
        let now = Instant::now();
        let mut sequencer = Sequencer::new("r", Duration::from_millis(500));
        assert!(sequencer.push(update(4), now).is_empty());
        assert!(sequencer.push(discard(5), now).is_empty());
        assert_eq!(revisions(&sequencer.set_base(4, now)), vec![5]);
        // a later base is ignored
        assert!(sequencer.set_base(9, now).is_empty());
        assert_eq!(sequencer.released(), Some(5));
    }

    #[test_timeout::timeout]
    fn unrevisioned_events_pass_straight_through() {
        let now = Instant::now();
        let mut sequencer = Sequencer::new("r", Duration::from_millis(500));
        sequencer.set_base(0, now);
        assert!(sequencer.push(update(2), now).is_empty());
        let delete = RoomEnvelope {
            room: "r".into(),
            exclude: None,
            revision: None,
            event: ServerEvent::Delete { room: "r".into() },
        };
        assert_eq!(sequencer.push(delete.clone(), now), vec![delete]);
    }

    #[test_timeout::timeout]
    fn expired_gap_is_skipped() {
        let start = Instant::now();
        let window = Duration::from_millis(500);
        let mut sequencer = Sequencer::new("r", window);
        sequencer.set_base(0, start);
        assert!(sequencer.push(update(3), start).is_empty());
        assert_eq!(sequencer.deadline(), Some(start + window));

        let (skipped, ready) = sequencer.expire(start + Duration::from_millis(100));
        assert_eq!(skipped, 0);
        assert!(ready.is_empty());

        let (skipped, ready) = sequencer.expire(start + window);
        assert_eq!(skipped, 2);
        assert_eq!(revisions(&ready), vec![3]);
        assert_eq!(sequencer.deadline(), None);
        // a straggler from the skipped range is now stale
        assert!(sequencer.push(update(2), start + window).is_empty());
    }
}
