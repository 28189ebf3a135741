//! Deadlock detection using wait-for graph analysis.
//!
//! Every session blocked in a lock statement is a node with edges to the
//! sessions holding the row it wants:
//!
//! ```text
//! S1 waits for S2:  S1 -> S2
//! S2 waits for S1:  S2 -> S1 (cycle = deadlock!)
//! ```
//!
//! The graph lives inside the lock table's mutex, so it needs no locking of
//! its own. Edges are recomputed from the lock table before each check.
//!
//! # Victim Selection
//!
//! Which member of a cycle is rolled back is a [`VictimPolicy`]:
//! - `Requester`: the session whose request closed the cycle
//! - `OldestWaiter`: the session that has been waiting longest
//! - `LowestCost`: the cheapest session to redo (youngest, fewest locks)

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use commitlock_common::config::VictimPolicy;
use commitlock_common::types::{Oid, SessionId};

use crate::lock::LockMode;

/// A lock request a session is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// The row.
    pub oid: Oid,
    /// The requested mode.
    pub mode: LockMode,
    /// When the session started waiting.
    pub since: Instant,
}

/// A node in the wait-for graph representing a session.
#[derive(Debug, Clone)]
pub struct WfgNode {
    /// Session ID.
    pub session: SessionId,
    /// When the session's current transaction started.
    pub started_at: Instant,
    /// Number of row locks held.
    pub locks_held: usize,
    /// The request the session is blocked on, if any.
    pub waiting: Option<PendingRequest>,
}

impl WfgNode {
    /// Creates a new WFG node.
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            started_at: Instant::now(),
            locks_held: 0,
            waiting: None,
        }
    }

    /// Computes a "cost" for rolling back this session.
    /// Higher cost = less desirable to roll back.
    pub fn abort_cost(&self) -> i64 {
        let age_ms = self.started_at.elapsed().as_millis() as i64;
        age_ms + self.locks_held as i64 * 100
    }
}

/// The wait-for graph for deadlock detection.
#[derive(Default)]
pub struct WaitForGraph {
    /// Nodes in the graph.
    nodes: HashMap<SessionId, WfgNode>,
    /// Edges: waiter -> set of holders it's waiting for.
    edges: HashMap<SessionId, HashSet<SessionId>>,
}

impl WaitForGraph {
    /// Creates a new empty wait-for graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session to the graph.
    pub fn add_session(&mut self, session: SessionId) {
        self.nodes
            .entry(session)
            .or_insert_with(|| WfgNode::new(session));
    }

    /// Removes a session and every edge touching it.
    pub fn remove_session(&mut self, session: SessionId) {
        self.nodes.remove(&session);
        self.edges.remove(&session);
        for holders in self.edges.values_mut() {
            holders.remove(&session);
        }
    }

    /// Marks the start of a new transaction on `session`.
    pub fn restart(&mut self, session: SessionId) {
        if let Some(node) = self.nodes.get_mut(&session) {
            node.started_at = Instant::now();
        }
    }

    /// Records that `session` is blocked on `oid` by `holders`.
    ///
    /// The wait start is kept while the request stays the same.
    pub fn set_waiting(
        &mut self,
        session: SessionId,
        oid: Oid,
        mode: LockMode,
        holders: impl IntoIterator<Item = SessionId>,
    ) {
        self.add_session(session);
        if let Some(node) = self.nodes.get_mut(&session) {
            let same = node
                .waiting
                .map_or(false, |req| req.oid == oid && req.mode == mode);
            if !same {
                node.waiting = Some(PendingRequest {
                    oid,
                    mode,
                    since: Instant::now(),
                });
            }
        }
        self.set_edges(session, holders);
    }

    /// Replaces the edges out of `waiter`.
    pub fn set_edges(&mut self, waiter: SessionId, holders: impl IntoIterator<Item = SessionId>) {
        let holders: HashSet<SessionId> = holders.into_iter().filter(|h| *h != waiter).collect();
        if holders.is_empty() {
            self.edges.remove(&waiter);
        } else {
            self.edges.insert(waiter, holders);
        }
    }

    /// Clears the pending request and all waits for a session.
    pub fn clear_waits(&mut self, waiter: SessionId) {
        self.edges.remove(&waiter);
        if let Some(node) = self.nodes.get_mut(&waiter) {
            node.waiting = None;
        }
    }

    /// Updates the number of locks a session holds.
    pub fn update_locks_held(&mut self, session: SessionId, locks_held: usize) {
        if let Some(node) = self.nodes.get_mut(&session) {
            node.locks_held = locks_held;
        }
    }

    /// Returns every blocked session with its pending request.
    pub fn pending_requests(&self) -> Vec<(SessionId, PendingRequest)> {
        self.nodes
            .values()
            .filter_map(|node| node.waiting.map(|req| (node.session, req)))
            .collect()
    }

    /// Returns true if the session is blocked on a request.
    pub fn is_waiting(&self, session: SessionId) -> bool {
        self.nodes
            .get(&session)
            .map_or(false, |node| node.waiting.is_some())
    }

    /// Returns what a session is waiting for.
    pub fn get_waits(&self, waiter: SessionId) -> Vec<SessionId> {
        self.edges
            .get(&waiter)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns true if `session` is registered.
    pub fn contains(&self, session: SessionId) -> bool {
        self.nodes.contains_key(&session)
    }

    /// Returns the number of sessions in the graph.
    pub fn session_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of wait edges.
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|s| s.len()).sum()
    }

    /// Finds a cycle reachable from `start`.
    ///
    /// Returns the cycle's members in wait order, each exactly once.
    pub fn detect_deadlock(&self, start: SessionId) -> Option<Vec<SessionId>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.dfs_find_cycle(start, &mut visited, &mut path) {
            Some(Self::extract_cycle(&path))
        } else {
            None
        }
    }

    fn dfs_find_cycle(
        &self,
        current: SessionId,
        visited: &mut HashSet<SessionId>,
        path: &mut Vec<SessionId>,
    ) -> bool {
        if path.contains(&current) {
            path.push(current);
            return true;
        }
        if !visited.insert(current) {
            return false;
        }

        path.push(current);
        if let Some(holders) = self.edges.get(&current) {
            // Sorted so the same graph always yields the same cycle.
            let mut holders: Vec<SessionId> = holders.iter().copied().collect();
            holders.sort_unstable();
            for holder in holders {
                if self.dfs_find_cycle(holder, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// The path ends with the node that closed the cycle; the cycle starts
    /// at that node's first occurrence.
    fn extract_cycle(path: &[SessionId]) -> Vec<SessionId> {
        let Some((&closing, rest)) = path.split_last() else {
            return Vec::new();
        };
        let start = rest.iter().position(|s| *s == closing).unwrap_or(0);
        rest[start..].to_vec()
    }

    /// Selects the member of `cycle` to roll back.
    pub fn select_victim(
        &self,
        cycle: &[SessionId],
        policy: VictimPolicy,
        requester: SessionId,
    ) -> Option<SessionId> {
        match policy {
            VictimPolicy::Requester if cycle.contains(&requester) => Some(requester),
            // The requester is not part of the cycle: fall back to the member
            // whose wait began most recently.
            VictimPolicy::Requester => cycle
                .iter()
                .copied()
                .max_by_key(|s| self.waiting_since(*s)),
            VictimPolicy::OldestWaiter => cycle
                .iter()
                .copied()
                .min_by_key(|s| self.waiting_since(*s)),
            VictimPolicy::LowestCost => cycle.iter().copied().min_by_key(|s| {
                self.nodes.get(s).map_or(0, WfgNode::abort_cost)
            }),
        }
    }

    fn waiting_since(&self, session: SessionId) -> Option<Instant> {
        self.nodes
            .get(&session)
            .and_then(|node| node.waiting.map(|req| req.since))
    }
}

impl fmt::Debug for WaitForGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForGraph")
            .field("session_count", &self.session_count())
            .field("edge_count", &self.edge_count())
            .finish()
    }
}

/// Formats a cycle as `session-1 -> session-2 -> session-1`.
pub fn format_cycle(cycle: &[SessionId]) -> String {
    let mut parts: Vec<String> = cycle.iter().map(ToString::to_string).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn s(id: u64) -> SessionId {
        SessionId::new(id)
    }

    fn wait(wfg: &mut WaitForGraph, waiter: u64, holder: u64) {
        wfg.set_waiting(s(waiter), Oid::new(holder), LockMode::Shared, [s(holder)]);
    }

    #[test]
    fn test_wfg_add_remove() {
        let mut wfg = WaitForGraph::new();
        wfg.add_session(s(1));
        wfg.add_session(s(2));
        assert_eq!(wfg.session_count(), 2);

        wait(&mut wfg, 1, 2);
        assert_eq!(wfg.edge_count(), 1);
        assert!(wfg.is_waiting(s(1)));

        wfg.clear_waits(s(1));
        assert_eq!(wfg.edge_count(), 0);
        assert!(!wfg.is_waiting(s(1)));

        wait(&mut wfg, 1, 2);
        wfg.remove_session(s(2));
        assert_eq!(wfg.edge_count(), 0);
        assert_eq!(wfg.session_count(), 1);
    }

    #[test]
    fn test_no_deadlock() {
        let mut wfg = WaitForGraph::new();
        // S1 -> S2 -> S3 (no cycle)
        wait(&mut wfg, 1, 2);
        wait(&mut wfg, 2, 3);

        assert!(wfg.detect_deadlock(s(1)).is_none());
        assert!(wfg.detect_deadlock(s(2)).is_none());
    }

    #[test]
    fn test_simple_deadlock() {
        let mut wfg = WaitForGraph::new();
        wait(&mut wfg, 1, 2);
        wait(&mut wfg, 2, 1);

        let cycle = wfg.detect_deadlock(s(1)).unwrap();
        assert_eq!(cycle, vec![s(1), s(2)]);
        assert_eq!(format_cycle(&cycle), "session-1 -> session-2 -> session-1");
    }

    #[test]
    fn test_cycle_excludes_tail() {
        let mut wfg = WaitForGraph::new();
        // S1 -> S2 -> S3 -> S2
        wait(&mut wfg, 1, 2);
        wait(&mut wfg, 2, 3);
        wait(&mut wfg, 3, 2);

        let cycle = wfg.detect_deadlock(s(1)).unwrap();
        assert_eq!(cycle, vec![s(2), s(3)]);
    }

    #[test]
    fn test_three_way_deadlock() {
        let mut wfg = WaitForGraph::new();
        wait(&mut wfg, 1, 2);
        wait(&mut wfg, 2, 3);
        wait(&mut wfg, 3, 1);

        let cycle = wfg.detect_deadlock(s(3)).unwrap();
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn test_requester_victim() {
        let mut wfg = WaitForGraph::new();
        wait(&mut wfg, 1, 2);
        wait(&mut wfg, 2, 1);
        let cycle = wfg.detect_deadlock(s(2)).unwrap();

        assert_eq!(
            wfg.select_victim(&cycle, VictimPolicy::Requester, s(2)),
            Some(s(2))
        );
    }

    #[test]
    fn test_oldest_waiter_victim() {
        let mut wfg = WaitForGraph::new();
        wait(&mut wfg, 1, 2);
        thread::sleep(Duration::from_millis(2));
        wait(&mut wfg, 2, 1);
        let cycle = wfg.detect_deadlock(s(2)).unwrap();

        assert_eq!(
            wfg.select_victim(&cycle, VictimPolicy::OldestWaiter, s(2)),
            Some(s(1))
        );
    }

    #[test]
    fn test_lowest_cost_victim() {
        let mut wfg = WaitForGraph::new();
        wait(&mut wfg, 1, 2);
        wait(&mut wfg, 2, 1);
        wfg.update_locks_held(s(1), 10);
        wfg.update_locks_held(s(2), 1);
        let cycle = wfg.detect_deadlock(s(1)).unwrap();

        assert_eq!(
            wfg.select_victim(&cycle, VictimPolicy::LowestCost, s(1)),
            Some(s(2))
        );
    }

    #[test]
    fn test_wait_start_kept_for_same_request() {
        let mut wfg = WaitForGraph::new();
        wait(&mut wfg, 1, 2);
        let first = wfg.waiting_since(s(1));
        thread::sleep(Duration::from_millis(2));
        wait(&mut wfg, 1, 2);
        assert_eq!(wfg.waiting_since(s(1)), first);
        assert_eq!(wfg.get_waits(s(1)), vec![s(2)]);
    }
}
