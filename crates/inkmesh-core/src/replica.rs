//! Local replica of the shared drawing document.
//!
//! The replica is a map of strokes keyed by id plus a clear epoch:
//!
//! - `create_stroke` and `append_point` are idempotent and commute.
//! - `append_point` for an unknown stroke is buffered until its
//!   `create_stroke` arrives, then merged in sequence order.
//! - `clear` raises the epoch; strokes from older epochs are dropped and late
//!   operations for them are ignored.
//!
//! Strokes are drawn in `(clock, author, id)` order, where `clock` is a
//! Lamport timestamp taken at creation. Two replicas holding the same set of
//! operations therefore agree on both content and draw order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kurbo::Point;

use crate::ops::{Operation, PeerId};
use crate::stroke::{Stroke, StrokeId};

/// Default bound on buffered out-of-order points.
pub const DEFAULT_MAX_PENDING_POINTS: usize = 4096;

/// Callback invoked after every visible change.
pub type ChangeCallback = Box<dyn FnMut(&ReplicaChange) + Send>;

/// A visible change to the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaChange {
    StrokeCreated { id: StrokeId },
    PointsAppended { id: StrokeId, count: usize },
    Cleared { epoch: u64, removed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DrawKey {
    clock: u64,
    author: PeerId,
    id: StrokeId,
}

impl DrawKey {
    fn of(stroke: &Stroke) -> Self {
        Self {
            clock: stroke.clock,
            author: stroke.author.clone(),
            id: stroke.id.clone(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    stroke: Stroke,
    /// All known points keyed by sequence number.
    seqs: BTreeMap<u32, Point>,
    /// Number of points carried by the create operation.
    initial_len: u32,
}

impl Entry {
    /// Insert a point, returning false for duplicates.
    fn insert(&mut self, seq: u32, point: Point) -> bool {
        let is_tail = self.seqs.keys().next_back().is_none_or(|last| seq > *last);
        if self.seqs.contains_key(&seq) {
            return false;
        }
        self.seqs.insert(seq, point);
        if is_tail {
            self.stroke.points.push(point);
        } else {
            self.stroke.points = self.seqs.values().copied().collect();
        }
        true
    }
}

#[derive(Debug)]
struct Pending {
    epoch: u64,
    points: BTreeMap<u32, Point>,
    arrival: u64,
}

/// The local in-memory copy of the shared document.
pub struct Replica {
    peer_id: PeerId,
    epoch: u64,
    clock: u64,
    strokes: HashMap<StrokeId, Entry>,
    order: BTreeSet<DrawKey>,
    pending: HashMap<StrokeId, Pending>,
    pending_points: usize,
    max_pending_points: usize,
    arrivals: u64,
    listeners: Vec<ChangeCallback>,
}

impl Replica {
    /// Create an empty replica owned by `peer_id`.
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            epoch: 0,
            clock: 0,
            strokes: HashMap::new(),
            order: BTreeSet::new(),
            pending: HashMap::new(),
            pending_points: 0,
            max_pending_points: DEFAULT_MAX_PENDING_POINTS,
            arrivals: 0,
            listeners: Vec::new(),
        }
    }

    /// Set the bound on buffered out-of-order points.
    pub fn with_max_pending_points(mut self, max: usize) -> Self {
        self.max_pending_points = max;
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Latest observed clear epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current Lamport clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn stroke_count(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    /// Number of buffered points waiting for their stroke.
    pub fn pending_count(&self) -> usize {
        self.pending_points
    }

    pub fn contains(&self, id: &str) -> bool {
        self.strokes.contains_key(id)
    }

    /// Get a stroke by id.
    pub fn stroke(&self, id: &str) -> Option<&Stroke> {
        self.strokes.get(id).map(|e| &e.stroke)
    }

    /// Strokes in draw order (back to front).
    pub fn strokes(&self) -> impl Iterator<Item = &Stroke> {
        self.order
            .iter()
            .filter_map(|key| self.strokes.get(&key.id).map(|e| &e.stroke))
    }

    /// Register a change listener.
    pub fn on_change(&mut self, callback: impl FnMut(&ReplicaChange) + Send + 'static) {
        self.listeners.push(Box::new(callback));
    }

    // --- Applying operations ---

    /// Apply an operation produced by this peer.
    ///
    /// Stamps epoch, Lamport clock and author on new strokes and the next
    /// epoch on clears. Returns the stamped operation to broadcast, or `None`
    /// if nothing changed.
    pub fn apply_local(&mut self, op: Operation) -> Option<Operation> {
        let op = match op {
            Operation::CreateStroke { mut stroke } => {
                self.clock += 1;
                stroke.epoch = self.epoch;
                stroke.clock = self.clock;
                stroke.author = self.peer_id.clone();
                Operation::CreateStroke { stroke }
            }
            Operation::AppendPoint {
                stroke_id,
                seq,
                point,
                ..
            } => {
                let Some(entry) = self.strokes.get(&stroke_id) else {
                    log::warn!("Local append to unknown stroke {}", stroke_id);
                    return None;
                };
                let epoch = entry.stroke.epoch;
                Operation::AppendPoint {
                    stroke_id,
                    epoch,
                    seq,
                    point,
                }
            }
            Operation::Clear { .. } => Operation::Clear {
                epoch: self.epoch + 1,
            },
        };

        self.integrate(&op).map(|_| op)
    }

    /// Apply an operation received from a peer.
    ///
    /// Returns true if the visible document changed.
    pub fn apply_remote(&mut self, op: &Operation) -> bool {
        self.integrate(op).is_some()
    }

    /// Full current operation set, for catching up a new peer.
    pub fn snapshot(&self) -> Vec<Operation> {
        let mut ops = Vec::new();
        if self.epoch > 0 {
            ops.push(Operation::Clear { epoch: self.epoch });
        }

        for entry in self.order.iter().filter_map(|key| self.strokes.get(&key.id)) {
            let mut stroke = entry.stroke.clone();
            stroke.points = entry
                .seqs
                .range(..entry.initial_len)
                .map(|(_, p)| *p)
                .collect();
            ops.push(Operation::CreateStroke { stroke });
            for (seq, point) in entry.seqs.range(entry.initial_len..) {
                ops.push(Operation::append(entry.stroke.id.clone(), entry.stroke.epoch, *seq, *point));
            }
        }

        let mut pending: Vec<_> = self.pending.iter().collect();
        pending.sort_by(|a, b| a.0.cmp(b.0));
        for (id, buffered) in pending {
            for (seq, point) in &buffered.points {
                ops.push(Operation::append(id.clone(), buffered.epoch, *seq, *point));
            }
        }

        ops
    }

    /// Drop all state and listeners.
    pub fn reset(&mut self) {
        self.epoch = 0;
        self.clock = 0;
        self.strokes.clear();
        self.order.clear();
        self.pending.clear();
        self.pending_points = 0;
        self.listeners.clear();
    }

    fn integrate(&mut self, op: &Operation) -> Option<ReplicaChange> {
        let change = match op {
            Operation::CreateStroke { stroke } => self.create(stroke),
            Operation::AppendPoint {
                stroke_id,
                epoch,
                seq,
                point,
            } => self.append(stroke_id, *epoch, *seq, *point),
            Operation::Clear { epoch } => self.clear(*epoch),
        }?;

        for listener in self.listeners.iter_mut() {
            listener(&change);
        }
        Some(change)
    }

    fn create(&mut self, stroke: &Stroke) -> Option<ReplicaChange> {
        if stroke.epoch < self.epoch {
            log::debug!("Ignoring stroke {} from cleared epoch {}", stroke.id, stroke.epoch);
            self.drop_pending(&stroke.id);
            return None;
        }
        if self.strokes.contains_key(&stroke.id) {
            return None;
        }

        self.clock = self.clock.max(stroke.clock);

        let seqs: BTreeMap<u32, Point> = (0u32..).zip(stroke.points.iter().copied()).collect();
        let initial_len = seqs.len() as u32;
        let mut entry = Entry {
            stroke: stroke.clone(),
            seqs,
            initial_len,
        };

        if let Some(buffered) = self.pending.remove(&stroke.id) {
            self.pending_points -= buffered.points.len();
            log::debug!(
                "Replaying {} buffered point(s) for stroke {}",
                buffered.points.len(),
                stroke.id
            );
            for (seq, point) in buffered.points {
                entry.seqs.entry(seq).or_insert(point);
            }
            entry.stroke.points = entry.seqs.values().copied().collect();
        }

        self.order.insert(DrawKey::of(&entry.stroke));
        self.strokes.insert(stroke.id.clone(), entry);
        Some(ReplicaChange::StrokeCreated {
            id: stroke.id.clone(),
        })
    }

    fn append(&mut self, id: &str, epoch: u64, seq: u32, point: Point) -> Option<ReplicaChange> {
        if epoch < self.epoch {
            log::debug!("Ignoring late point for stroke {} from epoch {}", id, epoch);
            return None;
        }

        if let Some(entry) = self.strokes.get_mut(id) {
            return entry.insert(seq, point).then(|| ReplicaChange::PointsAppended {
                id: id.to_string(),
                count: 1,
            });
        }

        self.arrivals += 1;
        let arrival = self.arrivals;
        let buffered = self.pending.entry(id.to_string()).or_insert_with(|| Pending {
            epoch,
            points: BTreeMap::new(),
            arrival,
        });
        if buffered.points.insert(seq, point).is_none() {
            self.pending_points += 1;
        }
        self.enforce_pending_bound();
        None
    }

    fn clear(&mut self, epoch: u64) -> Option<ReplicaChange> {
        if epoch <= self.epoch {
            return None;
        }
        self.epoch = epoch;

        let before = self.strokes.len();
        self.strokes.retain(|_, e| e.stroke.epoch >= epoch);
        let strokes = &self.strokes;
        self.order.retain(|key| strokes.contains_key(&key.id));

        self.pending.retain(|_, p| p.epoch >= epoch);
        self.pending_points = self.pending.values().map(|p| p.points.len()).sum();

        let removed = before - self.strokes.len();
        log::info!("Cleared to epoch {} ({} stroke(s) removed)", epoch, removed);
        Some(ReplicaChange::Cleared { epoch, removed })
    }

    fn drop_pending(&mut self, id: &str) {
        if let Some(buffered) = self.pending.remove(id) {
            self.pending_points -= buffered.points.len();
        }
    }

    fn enforce_pending_bound(&mut self) {
        while self.pending_points > self.max_pending_points {
            let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.arrival)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            log::warn!("Pending point buffer full, dropping points for stroke {}", oldest);
            self.drop_pending(&oldest);
        }
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("peer_id", &self.peer_id)
            .field("epoch", &self.epoch)
            .field("clock", &self.clock)
            .field("strokes", &self.strokes.len())
            .field("pending_points", &self.pending_points)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::{Brush, Tool};
    use std::sync::{Arc, Mutex};

    fn create(id: &str, points: &[(f64, f64)]) -> Operation {
        let points = points.iter().map(|&(x, y)| Point::new(x, y)).collect();
        Operation::CreateStroke {
            stroke: Stroke::with_id(id, &Brush::default(), points),
        }
    }

    /// Ops for stroke `s1`: create at (0.1, 0.1) then two appends.
    fn scenario_ops(author: &mut Replica) -> Vec<Operation> {
        vec![
            author.apply_local(create("s1", &[(0.1, 0.1)])).unwrap(),
            author.apply_local(Operation::append("s1", 0, 1, Point::new(0.2, 0.2))).unwrap(),
            author.apply_local(Operation::append("s1", 0, 2, Point::new(0.3, 0.3))).unwrap(),
        ]
    }

    fn points(replica: &Replica, id: &str) -> Vec<Point> {
        replica.stroke(id).unwrap().points.clone()
    }

    #[test]
    fn test_apply_local_stamps_metadata() {
        let mut replica = Replica::new("peer-a");
        let op = replica.apply_local(create("s1", &[(0.5, 0.5)])).unwrap();
        let Operation::CreateStroke { stroke } = op else {
            panic!("Expected create");
        };
        assert_eq!(stroke.author, "peer-a");
        assert_eq!(stroke.clock, 1);
        assert_eq!(stroke.epoch, 0);
        assert_eq!(replica.stroke_count(), 1);
    }

    #[test]
    fn test_idempotent_remote_apply() {
        let mut author = Replica::new("a");
        let ops = scenario_ops(&mut author);

        let mut replica = Replica::new("b");
        for op in &ops {
            assert!(replica.apply_remote(op));
        }
        let before = points(&replica, "s1");
        for op in &ops {
            assert!(!replica.apply_remote(op));
        }
        assert_eq!(points(&replica, "s1"), before);
        assert_eq!(replica.stroke_count(), 1);
    }

    #[test]
    fn test_appends_before_create_are_buffered() {
        let mut author = Replica::new("a");
        let ops = scenario_ops(&mut author);

        let mut replica = Replica::new("b");
        assert!(!replica.apply_remote(&ops[2]));
        assert!(!replica.apply_remote(&ops[1]));
        assert_eq!(replica.pending_count(), 2);
        assert_eq!(replica.stroke_count(), 0);

        assert!(replica.apply_remote(&ops[0]));
        assert_eq!(replica.pending_count(), 0);
        assert_eq!(
            points(&replica, "s1"),
            vec![Point::new(0.1, 0.1), Point::new(0.2, 0.2), Point::new(0.3, 0.3)]
        );
    }

    #[test]
    fn test_reordered_appends_keep_sequence_order() {
        let mut author = Replica::new("a");
        let ops = scenario_ops(&mut author);

        let mut replica = Replica::new("b");
        replica.apply_remote(&ops[0]);
        replica.apply_remote(&ops[2]);
        replica.apply_remote(&ops[1]);
        assert_eq!(points(&replica, "s1"), points(&author, "s1"));
    }

    #[test]
    fn test_clear_empties_snapshot() {
        let mut replica = Replica::new("a");
        replica.apply_local(create("s1", &[(0.1, 0.1)]));
        replica.apply_local(create("s2", &[(0.2, 0.2)]));

        let clear = replica.apply_local(Operation::Clear { epoch: 0 }).unwrap();
        assert_eq!(clear, Operation::Clear { epoch: 1 });
        assert!(replica.is_empty());
        assert_eq!(replica.snapshot(), vec![Operation::Clear { epoch: 1 }]);
    }

    #[test]
    fn test_late_append_after_clear_ignored() {
        let mut author = Replica::new("a");
        let ops = scenario_ops(&mut author);

        let mut replica = Replica::new("b");
        replica.apply_remote(&ops[0]);
        replica.apply_remote(&Operation::Clear { epoch: 1 });
        assert!(!replica.apply_remote(&ops[1]));
        assert!(!replica.apply_remote(&ops[0]));
        assert!(replica.is_empty());
        assert_eq!(replica.pending_count(), 0);
    }

    #[test]
    fn test_clear_discards_buffered_points() {
        let mut replica = Replica::new("b");
        replica.apply_remote(&Operation::append("ghost", 0, 1, Point::new(0.5, 0.5)));
        assert_eq!(replica.pending_count(), 1);
        replica.apply_remote(&Operation::Clear { epoch: 1 });
        assert_eq!(replica.pending_count(), 0);
    }

    #[test]
    fn test_concurrent_clears_converge() {
        let mut a = Replica::new("a");
        let mut b = Replica::new("b");
        let shared = a.apply_local(create("s1", &[(0.1, 0.1)])).unwrap();
        b.apply_remote(&shared);

        let clear_a = a.apply_local(Operation::Clear { epoch: 0 }).unwrap();
        let clear_b = b.apply_local(Operation::Clear { epoch: 0 }).unwrap();
        assert!(!a.apply_remote(&clear_b));
        assert!(!b.apply_remote(&clear_a));

        assert!(a.is_empty() && b.is_empty());
        assert_eq!(a.epoch(), b.epoch());
    }

    #[test]
    fn test_higher_epoch_wins() {
        let mut replica = Replica::new("a");
        replica.apply_remote(&Operation::Clear { epoch: 3 });
        assert!(!replica.apply_remote(&Operation::Clear { epoch: 2 }));
        assert_eq!(replica.epoch(), 3);
    }

    #[test]
    fn test_stroke_after_clear_survives_older_clear() {
        let mut a = Replica::new("a");
        a.apply_local(Operation::Clear { epoch: 0 });
        let fresh = a.apply_local(create("s2", &[(0.4, 0.4)])).unwrap();

        let mut b = Replica::new("b");
        b.apply_remote(&fresh);
        b.apply_remote(&Operation::Clear { epoch: 1 });
        assert!(b.contains("s2"));
    }

    #[test]
    fn test_draw_order_independent_of_delivery() {
        let mut a = Replica::new("a");
        let mut b = Replica::new("b");
        let from_a = a.apply_local(create("sa", &[(0.1, 0.1)])).unwrap();
        let from_b = b.apply_local(create("sb", &[(0.2, 0.2)])).unwrap();

        let mut first = Replica::new("c");
        first.apply_remote(&from_a);
        first.apply_remote(&from_b);
        let mut second = Replica::new("d");
        second.apply_remote(&from_b);
        second.apply_remote(&from_a);

        let order = |r: &Replica| r.strokes().map(|s| s.id.clone()).collect::<Vec<_>>();
        assert_eq!(order(&first), order(&second));
        assert_eq!(order(&first), vec!["sa".to_string(), "sb".to_string()]);
    }

    #[test]
    fn test_lamport_clock_orders_causal_strokes() {
        let mut a = Replica::new("z-peer");
        let mut b = Replica::new("a-peer");
        let first = a.apply_local(create("first", &[(0.1, 0.1)])).unwrap();
        b.apply_remote(&first);
        b.apply_local(create("second", &[(0.2, 0.2)]));

        let ids: Vec<_> = b.strokes().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_snapshot_replays_full_operation_set() {
        let mut author = Replica::new("a");
        let mut sent = Vec::new();
        for i in 0..10 {
            let id = format!("s{}", i);
            sent.push(author.apply_local(create(&id, &[(0.1, 0.1)])).unwrap());
            for seq in 1..5 {
                let p = Point::new(0.1 + seq as f64 * 0.05, 0.1 * i as f64);
                sent.push(author.apply_local(Operation::append(id.as_str(), 0, seq, p)).unwrap());
            }
        }
        assert_eq!(sent.len(), 50);

        let snapshot = author.snapshot();
        assert_eq!(snapshot.len(), 50);

        let mut joiner = Replica::new("c");
        for op in &snapshot {
            joiner.apply_remote(op);
        }
        let a: Vec<_> = author.strokes().cloned().collect();
        let c: Vec<_> = joiner.strokes().cloned().collect();
        assert_eq!(a, c);
    }

    #[test]
    fn test_snapshot_carries_buffered_appends() {
        let mut author = Replica::new("a");
        let ops = scenario_ops(&mut author);

        // The relayer saw the appends but not yet the create.
        let mut relayer = Replica::new("b");
        relayer.apply_remote(&ops[2]);
        relayer.apply_remote(&ops[1]);
        let snapshot = relayer.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|op| matches!(op, Operation::AppendPoint { .. })));

        let mut joiner = Replica::new("c");
        for op in &snapshot {
            joiner.apply_remote(op);
        }
        assert_eq!(joiner.pending_count(), 2);
        assert!(joiner.apply_remote(&ops[0]));
        assert_eq!(points(&joiner, "s1"), points(&author, "s1"));
        assert_eq!(joiner.pending_count(), 0);
    }

    #[test]
    fn test_pending_buffer_is_bounded() {
        let mut replica = Replica::new("a").with_max_pending_points(3);
        replica.apply_remote(&Operation::append("old", 0, 1, Point::new(0.1, 0.1)));
        replica.apply_remote(&Operation::append("old", 0, 2, Point::new(0.1, 0.2)));
        replica.apply_remote(&Operation::append("new", 0, 1, Point::new(0.3, 0.3)));
        replica.apply_remote(&Operation::append("new", 0, 2, Point::new(0.3, 0.4)));
        assert_eq!(replica.pending_count(), 2);

        let mut brush = Brush::default();
        brush.tool = Tool::Eraser;
        let op = Operation::CreateStroke {
            stroke: Stroke::with_id("new", &brush, vec![Point::new(0.3, 0.2)]),
        };
        replica.apply_remote(&op);
        assert_eq!(replica.stroke("new").unwrap().len(), 3);
    }

    #[test]
    fn test_on_change_notifies_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut replica = Replica::new("a");
        replica.on_change(move |change| sink.lock().unwrap().push(change.clone()));

        replica.apply_local(create("s1", &[(0.1, 0.1)]));
        replica.apply_local(Operation::append("s1", 0, 1, Point::new(0.2, 0.2)));
        replica.apply_local(Operation::Clear { epoch: 0 });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ReplicaChange::StrokeCreated { id: "s1".into() });
        assert_eq!(seen[2], ReplicaChange::Cleared { epoch: 1, removed: 1 });
    }

    #[test]
    fn test_local_append_to_unknown_stroke_rejected() {
        let mut replica = Replica::new("a");
        assert!(replica.apply_local(Operation::append("nope", 0, 1, Point::ZERO)).is_none());
    }
}
