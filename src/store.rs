use crate::events::RenewalEvent;
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Renewal eligibility record for one user with auto-renewal enabled.
///
/// `remaining_renewals` is absent until the first AutoRenewalExecuted event is
/// observed; the chain decrements it, we only mirror the value from events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalRecord {
    pub user: Address,
    pub plan_id: U256,
    pub subscription: Address,
    #[serde(default)]
    pub remaining_renewals: Option<u32>,
}

/// In-memory map of user -> renewal record, keyed by user address.
///
/// Mutated only by event application within a poll cycle, so no locking.
/// Stored as a BTreeMap for deterministic iteration and state-file diffs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenewalStore {
    records: BTreeMap<Address, RenewalRecord>,
}

impl RenewalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: &Address) -> Option<&RenewalRecord> {
        self.records.get(user)
    }

    pub fn set(&mut self, record: RenewalRecord) {
        self.records.insert(record.user, record);
    }

    pub fn delete(&mut self, user: &Address) -> Option<RenewalRecord> {
        self.records.remove(user)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenewalRecord> {
        self.records.values()
    }

    /// Snapshot of all current records; the scheduler iterates this copy so the
    /// store stays free for the next cycle's reconciliation.
    pub fn snapshot(&self) -> Vec<RenewalRecord> {
        self.iter().cloned().collect()
    }

    /// Apply one decoded event from `subscription` to the store.
    ///
    /// Each event is a last-write-wins projection onto the user's record, never a
    /// counter increment, so redelivery across overlapping scans is harmless:
    /// - enabled: insert/replace the record (remaining unknown until executed)
    /// - disabled: remove the record regardless of prior state
    /// - executed(remaining > 0): refresh remaining iff a record exists
    /// - executed(remaining == 0): the authorization is fully consumed; remove
    ///
    /// An executed event for an unknown user is dropped: the scheduler, not the
    /// scan, originates renewal attempts, and executed events only refresh the
    /// remaining count.
    pub fn apply(&mut self, subscription: Address, event: &RenewalEvent) {
        match event {
            RenewalEvent::Enabled(ev) => {
                self.set(RenewalRecord {
                    user: ev.user,
                    plan_id: ev.plan_id,
                    subscription,
                    remaining_renewals: None,
                });
                tracing::info!(user = ?ev.user, plan_id = %ev.plan_id, "auto-renewal enabled");
            }
            RenewalEvent::Disabled(ev) => {
                if self.delete(&ev.user).is_some() {
                    tracing::info!(user = ?ev.user, plan_id = %ev.plan_id, "auto-renewal disabled");
                }
            }
            RenewalEvent::Executed(ev) => {
                let Some(record) = self.get(&ev.user).cloned() else {
                    tracing::debug!(
                        user = ?ev.user,
                        plan_id = %ev.plan_id,
                        "executed event for untracked user; ignoring"
                    );
                    return;
                };
                if ev.remaining_renewals == 0 {
                    self.delete(&ev.user);
                    tracing::info!(user = ?ev.user, plan_id = %ev.plan_id, "auto-renewal exhausted");
                } else {
                    self.set(RenewalRecord {
                        remaining_renewals: Some(ev.remaining_renewals),
                        ..record
                    });
                    tracing::info!(
                        user = ?ev.user,
                        plan_id = %ev.plan_id,
                        remaining = ev.remaining_renewals,
                        "auto-renewal executed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DisabledEvent, EnabledEvent, ExecutedEvent};

    fn user(n: u8) -> Address {
        Address::from_low_u64_be(n as u64)
    }

    fn sub_addr() -> Address {
        Address::from_low_u64_be(0x5ab)
    }

    fn enabled(u: Address) -> RenewalEvent {
        RenewalEvent::Enabled(EnabledEvent {
            user: u,
            plan_id: U256::from(1u64),
            max_renewals: 10,
            max_price: U256::from(100u64),
            authorized_at: 0,
        })
    }

    fn disabled(u: Address) -> RenewalEvent {
        RenewalEvent::Disabled(DisabledEvent {
            user: u,
            plan_id: U256::from(1u64),
            disabled_at: 0,
        })
    }

    fn executed(u: Address, remaining: u32) -> RenewalEvent {
        RenewalEvent::Executed(ExecutedEvent {
            user: u,
            plan_id: U256::from(1u64),
            new_end_time: 2000,
            amount_paid: U256::from(100u64),
            remaining_renewals: remaining,
        })
    }

    #[test]
    fn enabled_then_executed_keeps_record_with_remaining() {
        let mut store = RenewalStore::new();
        store.apply(sub_addr(), &enabled(user(1)));
        store.apply(sub_addr(), &executed(user(1), 3));

        let rec = store.get(&user(1)).expect("record present");
        assert_eq!(rec.remaining_renewals, Some(3));
        assert_eq!(rec.subscription, sub_addr());
    }

    #[test]
    fn executed_with_zero_remaining_removes_record() {
        let mut store = RenewalStore::new();
        store.apply(sub_addr(), &enabled(user(1)));
        store.apply(sub_addr(), &executed(user(1), 1));
        store.apply(sub_addr(), &executed(user(1), 0));
        assert!(store.get(&user(1)).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn disabled_removes_record_regardless_of_prior_state() {
        let mut store = RenewalStore::new();
        store.apply(sub_addr(), &enabled(user(1)));
        store.apply(sub_addr(), &executed(user(1), 5));
        store.apply(sub_addr(), &disabled(user(1)));
        assert!(store.get(&user(1)).is_none());

        // Disabled for a user that was never tracked is a no-op.
        store.apply(sub_addr(), &disabled(user(2)));
        assert!(store.is_empty());
    }

    #[test]
    fn executed_for_untracked_user_is_a_noop() {
        let mut store = RenewalStore::new();
        store.apply(sub_addr(), &enabled(user(1)));
        let before = store.clone();

        store.apply(sub_addr(), &executed(user(2), 4));
        assert_eq!(store, before);
    }

    #[test]
    fn re_enable_resets_remaining() {
        let mut store = RenewalStore::new();
        store.apply(sub_addr(), &enabled(user(1)));
        store.apply(sub_addr(), &executed(user(1), 2));
        // Fresh authorization replaces the record; remaining is unknown again.
        store.apply(sub_addr(), &enabled(user(1)));
        let rec = store.get(&user(1)).unwrap();
        assert_eq!(rec.remaining_renewals, None);
    }

    #[test]
    fn redelivered_events_are_idempotent() {
        let mut store = RenewalStore::new();
        store.apply(sub_addr(), &enabled(user(1)));
        store.apply(sub_addr(), &executed(user(1), 3));
        let once = store.clone();

        // Overlapping scans can redeliver the same events; last-write-wins
        // projection means replaying them changes nothing.
        store.apply(sub_addr(), &executed(user(1), 3));
        assert_eq!(store, once);
    }

    #[test]
    fn one_record_per_user() {
        let mut store = RenewalStore::new();
        store.apply(sub_addr(), &enabled(user(1)));
        store.apply(sub_addr(), &enabled(user(1)));
        assert_eq!(store.len(), 1);
    }
}
