//! Local actions awaiting acknowledgement from the peer.

use std::time::{Duration, Instant};

use crate::codec::Transport;

/// What a pending action is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    /// transport-replace awaiting transport-accept/-reject
    TransportReplace,
    /// content-add awaiting content-accept/-reject
    ContentAdd,
}

/// One outstanding local action
#[derive(Debug, Clone)]
pub struct PendingAction {
    /// Monotonic id, unique within the session
    pub id: u64,
    /// Kind
    pub kind: PendingKind,
    /// Content name the action concerns
    pub content: String,
    /// Proposed transport, for transport-replace
    pub proposed: Option<Transport>,
    /// When the action fails if unanswered
    pub deadline: Instant,
}

/// Outstanding actions of one session, correlated by (content, kind).
#[derive(Debug, Default)]
pub struct PendingLedger {
    next_id: u64,
    actions: Vec<PendingAction>,
}

impl PendingLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action; returns its id
    pub fn insert(
        &mut self,
        kind: PendingKind,
        content: &str,
        proposed: Option<Transport>,
        timeout: Duration,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.actions.push(PendingAction {
            id,
            kind,
            content: content.to_string(),
            proposed,
            deadline: Instant::now() + timeout,
        });
        id
    }

    /// Look up the action for a content
    pub fn find(&self, content: &str, kind: PendingKind) -> Option<&PendingAction> {
        self.actions
            .iter()
            .find(|a| a.content == content && a.kind == kind)
    }

    /// Remove and return the action for a content
    pub fn take(&mut self, content: &str, kind: PendingKind) -> Option<PendingAction> {
        let idx = self
            .actions
            .iter()
            .position(|a| a.content == content && a.kind == kind)?;
        Some(self.actions.remove(idx))
    }

    /// Remove and return an action by id
    pub fn take_id(&mut self, id: u64) -> Option<PendingAction> {
        let idx = self.actions.iter().position(|a| a.id == id)?;
        Some(self.actions.remove(idx))
    }

    /// Drop every action concerning a content; returns their ids
    pub fn remove_content(&mut self, content: &str) -> Vec<u64> {
        let (gone, kept): (Vec<_>, Vec<_>) = self
            .actions
            .drain(..)
            .partition(|a| a.content == content);
        self.actions = kept;
        gone.into_iter().map(|a| a.id).collect()
    }

    /// Drop everything; returns the ids
    pub fn clear(&mut self) -> Vec<u64> {
        self.actions.drain(..).map(|a| a.id).collect()
    }

    /// Number of outstanding actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(30);

    #[test]
    fn test_correlation_by_content_and_kind() {
        let mut ledger = PendingLedger::new();
        let a = ledger.insert(PendingKind::TransportReplace, "file", None, T);
        let b = ledger.insert(PendingKind::ContentAdd, "file", None, T);
        assert!(b > a);

        assert!(ledger.take("other", PendingKind::TransportReplace).is_none());
        assert_eq!(ledger.take("file", PendingKind::ContentAdd).unwrap().id, b);
        assert!(ledger.take("file", PendingKind::ContentAdd).is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut ledger = PendingLedger::new();
        let a = ledger.insert(PendingKind::ContentAdd, "x", None, T);
        ledger.take_id(a).unwrap();
        let b = ledger.insert(PendingKind::ContentAdd, "x", None, T);
        assert_ne!(a, b);
        assert!(ledger.take_id(a).is_none());
    }

    #[test]
    fn test_remove_content() {
        let mut ledger = PendingLedger::new();
        ledger.insert(PendingKind::ContentAdd, "x", None, T);
        ledger.insert(PendingKind::TransportReplace, "x", None, T);
        let y = ledger.insert(PendingKind::TransportReplace, "y", None, T);

        assert_eq!(ledger.remove_content("x").len(), 2);
        assert_eq!(ledger.clear(), vec![y]);
        assert!(ledger.is_empty());
    }
}
