//! Generic outstanding-request tracking.
//!
//! One `Poll` shape serves every multi-recipient request in the protocol:
//! welcome handshakes, service-join notification, roll-calls, and witness
//! confirmation. Each open poll carries a caller-supplied action value that
//! is handed back exactly once, when the poll completes. A poll completes
//! when every recipient responded, every recipient departed, its expiry
//! elapsed, or the caller closed it early; once closed it never reopens and
//! late responses are ignored.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use tokio::time::Instant;

use flock_proto::member::MemberId;

/// How a poll reached completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every remaining recipient responded.
    AllResponded,
    /// Every remaining recipient departed the cluster.
    Abandoned,
    /// The expiry elapsed with recipients outstanding.
    Expired,
    /// The caller closed the poll before completion.
    EarlyClosed,
}

/// One outstanding multi-recipient request.
#[derive(Debug)]
pub struct Poll {
    pub id: u64,
    /// Short label for logs.
    pub purpose: &'static str,
    pub remaining: BTreeSet<MemberId>,
    pub responded: BTreeSet<MemberId>,
    pub expiry: Option<Instant>,
    pub closed: bool,
}

impl Poll {
    /// True when the given member already answered this poll.
    pub fn has_response_from(&self, id: MemberId) -> bool {
        self.responded.contains(&id)
    }
}

/// Table of open polls plus their completion actions.
pub struct PollTable<A> {
    next_id: u64,
    polls: BTreeMap<u64, Poll>,
    actions: BTreeMap<u64, A>,
}

impl<A> PollTable<A> {
    pub fn new() -> Self {
        Self { next_id: 1, polls: BTreeMap::new(), actions: BTreeMap::new() }
    }

    /// Open a poll over a non-empty recipient set. The caller is expected
    /// to have handled the zero-recipient case directly (immediate
    /// completion with no request traffic).
    pub fn open(
        &mut self,
        purpose: &'static str,
        recipients: BTreeSet<MemberId>,
        expiry: Option<Instant>,
        action: A,
    ) -> u64 {
        debug_assert!(!recipients.is_empty(), "empty polls complete at the call site");
        let id = self.next_id;
        self.next_id += 1;
        self.polls.insert(id, Poll {
            id,
            purpose,
            remaining: recipients,
            responded: BTreeSet::new(),
            expiry,
            closed: false,
        });
        self.actions.insert(id, action);
        id
    }

    pub fn is_open(&self, id: u64) -> bool {
        self.polls.get(&id).map(|p| !p.closed).unwrap_or(false)
    }

    pub fn get(&self, id: u64) -> Option<&Poll> {
        self.polls.get(&id)
    }

    pub fn open_count(&self) -> usize {
        self.polls.len()
    }

    /// Record a response. Returns the completion action only when this
    /// response closed the poll. Responses to unknown or closed polls are
    /// ignored — a closed poll's decision is never reversed.
    pub fn respond(&mut self, id: u64, from: MemberId) -> Option<(Poll, A, PollOutcome)> {
        let poll = self.polls.get_mut(&id)?;
        if poll.closed || !poll.remaining.remove(&from) {
            return None;
        }
        poll.responded.insert(from);
        if poll.remaining.is_empty() {
            return self.take(id, PollOutcome::AllResponded);
        }
        None
    }

    /// Close a poll before completion (e.g. the first confirming witness
    /// already decided the question).
    pub fn close_early(&mut self, id: u64, from: Option<MemberId>) -> Option<(Poll, A, PollOutcome)> {
        let poll = self.polls.get_mut(&id)?;
        if poll.closed {
            return None;
        }
        if let Some(from) = from {
            poll.remaining.remove(&from);
            poll.responded.insert(from);
        }
        self.take(id, PollOutcome::EarlyClosed)
    }

    /// Drop a poll without running its action (e.g. superseded roll-call).
    pub fn cancel(&mut self, id: u64) {
        self.polls.remove(&id);
        self.actions.remove(&id);
    }

    /// A member departed: remove it from every poll's remaining set and
    /// return the polls this completed.
    pub fn member_departed(&mut self, id: MemberId) -> Vec<(Poll, A, PollOutcome)> {
        let completed: Vec<u64> = self
            .polls
            .values_mut()
            .filter_map(|p| {
                if !p.closed && p.remaining.remove(&id) && p.remaining.is_empty() {
                    Some(p.id)
                } else {
                    None
                }
            })
            .collect();
        completed
            .into_iter()
            .filter_map(|pid| self.take(pid, PollOutcome::Abandoned))
            .collect()
    }

    /// Collect every poll whose expiry has elapsed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<(Poll, A, PollOutcome)> {
        let due: Vec<u64> = self
            .polls
            .values()
            .filter(|p| !p.closed && p.expiry.map(|e| e <= now).unwrap_or(false))
            .map(|p| p.id)
            .collect();
        due.into_iter()
            .filter_map(|pid| self.take(pid, PollOutcome::Expired))
            .collect()
    }

    /// Earliest pending expiry, for the engine's timer wheel.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.polls.values().filter_map(|p| p.expiry).min()
    }

    fn take(&mut self, id: u64, outcome: PollOutcome) -> Option<(Poll, A, PollOutcome)> {
        let mut poll = self.polls.remove(&id)?;
        poll.closed = true;
        let action = self.actions.remove(&id)?;
        Some((poll, action, outcome))
    }
}

impl<A> Default for PollTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[MemberId]) -> BTreeSet<MemberId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn completes_when_all_respond() {
        let mut table: PollTable<&str> = PollTable::new();
        let id = table.open("welcome", set(&[2, 3]), None, "done");

        assert!(table.respond(id, 2).is_none());
        let (poll, action, outcome) = table.respond(id, 3).unwrap();
        assert_eq!(action, "done");
        assert_eq!(outcome, PollOutcome::AllResponded);
        assert_eq!(poll.responded, set(&[2, 3]));
    }

    #[test]
    fn closed_poll_ignores_late_responses() {
        let mut table: PollTable<&str> = PollTable::new();
        let id = table.open("witness", set(&[2, 3]), None, "escalate");

        let (_, action, outcome) = table.close_early(id, Some(2)).unwrap();
        assert_eq!(action, "escalate");
        assert_eq!(outcome, PollOutcome::EarlyClosed);

        // The decision already made is not reversed by a straggler.
        assert!(table.respond(id, 3).is_none());
        assert!(table.close_early(id, Some(3)).is_none());
    }

    #[test]
    fn duplicate_responses_do_not_double_count() {
        let mut table: PollTable<&str> = PollTable::new();
        let id = table.open("rollcall", set(&[2, 3]), None, "x");
        assert!(table.respond(id, 2).is_none());
        assert!(table.respond(id, 2).is_none());
        assert!(table.is_open(id));
    }

    #[test]
    fn abandoned_when_all_recipients_depart() {
        let mut table: PollTable<&str> = PollTable::new();
        let id = table.open("svc-join", set(&[4]), None, "apply");
        let completed = table.member_departed(4);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].2, PollOutcome::Abandoned);
        assert!(!table.is_open(id));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_elapses() {
        let mut table: PollTable<&str> = PollTable::new();
        let expiry = Instant::now() + std::time::Duration::from_millis(100);
        let id = table.open("api", set(&[2]), Some(expiry), "timeout");

        assert!(table.expire_due(Instant::now()).is_empty());
        tokio::time::advance(std::time::Duration::from_millis(150)).await;
        let due = table.expire_due(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].2, PollOutcome::Expired);
        assert!(!table.is_open(id));
    }
}
