//! Buffered delivery of external signals and queue items to subscriptions.
//!
//! Arrivals (`EventRaised`, `EventEnqueued`) and subscriptions
//! (`ExternalSubscribed`, `QueueSubscribed`) are both history events, so the
//! pairing below is a pure function of history order:
//!
//! - an arrival goes to the oldest waiting subscription for its key, otherwise it is buffered
//! - a new subscription takes the oldest buffered arrival for its key, otherwise it waits
//! - a released claim (race loser that never got observed) goes back to the buffer at its
//!   original position and may immediately satisfy another waiter

use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum MailboxKey {
    Signal(String),
    Queue(String),
}

#[derive(Debug, Clone)]
struct Claim {
    key: MailboxKey,
    arrival_id: u64,
    data: String,
}

#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    buffered: HashMap<MailboxKey, BTreeMap<u64, String>>,
    waiting: HashMap<MailboxKey, VecDeque<u64>>,
    claims: HashMap<u64, Claim>,
}

impl Mailbox {
    /// Record an arrival. Returns `(schedule_id, data)` when a waiting subscription takes it.
    pub(crate) fn arrive(&mut self, key: MailboxKey, arrival_id: u64, data: String) -> Option<(u64, String)> {
        if let Some(schedule_id) = self.waiting.get_mut(&key).and_then(|q| q.pop_front()) {
            self.claims.insert(
                schedule_id,
                Claim {
                    key,
                    arrival_id,
                    data: data.clone(),
                },
            );
            return Some((schedule_id, data));
        }
        self.buffered.entry(key).or_default().insert(arrival_id, data);
        None
    }

    /// Bind a subscription. Returns the buffered payload it claims, if any.
    pub(crate) fn subscribe(&mut self, key: MailboxKey, schedule_id: u64) -> Option<String> {
        let oldest = self.buffered.get_mut(&key).and_then(|b| b.pop_first());
        match oldest {
            Some((arrival_id, data)) => {
                self.claims.insert(
                    schedule_id,
                    Claim {
                        key,
                        arrival_id,
                        data: data.clone(),
                    },
                );
                Some(data)
            }
            None => {
                self.waiting.entry(key).or_default().push_back(schedule_id);
                None
            }
        }
    }

    /// Withdraw a subscription. A claimed payload is handed back and may be re-claimed
    /// by the next waiter, which is returned.
    pub(crate) fn release(&mut self, schedule_id: u64) -> Option<(u64, String)> {
        match self.claims.remove(&schedule_id) {
            Some(claim) => self.arrive(claim.key, claim.arrival_id, claim.data),
            None => {
                for q in self.waiting.values_mut() {
                    q.retain(|id| *id != schedule_id);
                }
                None
            }
        }
    }

    /// Queue items nobody has claimed, in arrival order. Signals are not included.
    pub(crate) fn unclaimed_queue_items(&self) -> Vec<(String, String)> {
        let mut items: Vec<(u64, String, String)> = self
            .buffered
            .iter()
            .filter_map(|(key, items)| match key {
                MailboxKey::Queue(queue) => Some((queue, items)),
                MailboxKey::Signal(_) => None,
            })
            .flat_map(|(queue, items)| {
                items
                    .iter()
                    .map(move |(arrival_id, data)| (*arrival_id, queue.clone(), data.clone()))
            })
            .collect();
        items.sort_by_key(|(arrival_id, _, _)| *arrival_id);
        items.into_iter().map(|(_, queue, data)| (queue, data)).collect()
    }
}
