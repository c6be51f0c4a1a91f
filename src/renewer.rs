use crate::contracts::Subscription;
use crate::store::RenewalRecord;
use ethers::providers::Middleware;
use ethers::types::{Address, H256, U256};
use eyre::{eyre, Result};
use std::fmt;
use std::sync::Arc;

/// Live subscription state, fresh-read per user per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionView {
    pub start_time: u64,
    pub end_time: u64,
    pub is_active: bool,
    pub renewals_count: u32,
}

/// Live auto-renewal authorization, fresh-read per user per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalAuth {
    pub is_enabled: bool,
    pub max_renewals: u32,
    pub remaining_renewals: u32,
    pub max_price: U256,
    pub authorized_at: u64,
}

/// Why a tracked user was not renewed this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SubscriptionInactive,
    AutoRenewDisabled,
    NotYetDue,
    NoRenewalsRemaining,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::SubscriptionInactive => "subscription inactive",
            SkipReason::AutoRenewDisabled => "auto-renew disabled",
            SkipReason::NotYetDue => "not yet due",
            SkipReason::NoRenewalsRemaining => "no renewals remaining",
        };
        f.write_str(s)
    }
}

/// The four-way eligibility conjunction. Empty result means renew now.
///
/// `now > end_time` is strict: a subscription ending exactly at `now` is not
/// yet due. The cached record is deliberately not consulted here; the live
/// read wins so we never act on stale remaining-renewal counts.
pub fn skip_reasons(now: u64, sub: &SubscriptionView, auth: &RenewalAuth) -> Vec<SkipReason> {
    let mut reasons = Vec::new();
    if !sub.is_active {
        reasons.push(SkipReason::SubscriptionInactive);
    }
    if !auth.is_enabled {
        reasons.push(SkipReason::AutoRenewDisabled);
    }
    if now <= sub.end_time {
        reasons.push(SkipReason::NotYetDue);
    }
    if auth.remaining_renewals == 0 {
        reasons.push(SkipReason::NoRenewalsRemaining);
    }
    reasons
}

/// Read/write surface of a per-plan subscription contract, keyed by contract
/// address. The seam exists so the renewal pass is unit-testable without a
/// live chain.
pub trait SubscriptionApi {
    async fn subscription(&self, contract: Address, user: Address) -> Result<SubscriptionView>;
    async fn renewal_auth(&self, contract: Address, user: Address) -> Result<RenewalAuth>;
    /// Submit autoRenew(user); returns the tx hash without awaiting finality.
    async fn auto_renew(&self, contract: Address, user: Address) -> Result<H256>;
}

/// Chain-backed implementation over the abigen binding.
pub struct SubscriptionClient<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> SubscriptionClient<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    fn contract(&self, address: Address) -> Subscription<M> {
        Subscription::new(address, self.client.clone())
    }
}

impl<M: Middleware + 'static> SubscriptionApi for SubscriptionClient<M> {
    async fn subscription(&self, contract: Address, user: Address) -> Result<SubscriptionView> {
        let (start_time, end_time, is_active, renewals_count) = self
            .contract(contract)
            .get_subscription(user)
            .call()
            .await
            .map_err(|e| eyre!("getSubscription({user:?}) failed: {e}"))?;
        Ok(SubscriptionView {
            start_time: narrow_u64(start_time, "startTime")?,
            end_time: narrow_u64(end_time, "endTime")?,
            is_active,
            renewals_count: narrow_u32(renewals_count, "renewalsCount")?,
        })
    }

    async fn renewal_auth(&self, contract: Address, user: Address) -> Result<RenewalAuth> {
        let (is_enabled, max_renewals, remaining_renewals, max_price, authorized_at) = self
            .contract(contract)
            .get_auto_renewal_auth(user)
            .call()
            .await
            .map_err(|e| eyre!("getAutoRenewalAuth({user:?}) failed: {e}"))?;
        Ok(RenewalAuth {
            is_enabled,
            max_renewals: narrow_u32(max_renewals, "maxRenewals")?,
            remaining_renewals: narrow_u32(remaining_renewals, "remainingRenewals")?,
            max_price,
            authorized_at: narrow_u64(authorized_at, "authorizedAt")?,
        })
    }

    async fn auto_renew(&self, contract: Address, user: Address) -> Result<H256> {
        let call = self.contract(contract).auto_renew(user);
        let pending = call
            .send()
            .await
            .map_err(|e| eyre!("autoRenew({user:?}) send failed: {e}"))?;
        Ok(pending.tx_hash())
    }
}

// Bindings declare small fields as uint256 (see contracts.rs); narrow here.
fn narrow_u64(v: U256, field: &str) -> Result<u64> {
    if v > U256::from(u64::MAX) {
        return Err(eyre!("{field} exceeds u64::MAX"));
    }
    Ok(v.as_u64())
}

fn narrow_u32(v: U256, field: &str) -> Result<u32> {
    if v > U256::from(u32::MAX) {
        return Err(eyre!("{field} exceeds u32::MAX"));
    }
    Ok(v.as_u32())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenewStats {
    pub checked: usize,
    pub renewed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Run the renewal pass over a snapshot of the store, sequentially.
///
/// Sequential on purpose: one in-flight RPC at a time bounds provider
/// rate-limit exposure, at the cost of cycle latency growing with the number
/// of tracked users. Per-user failures are logged and do not abort the rest
/// of the pass; a failed user stays in the store and is retried next tick.
pub async fn renew_due<A: SubscriptionApi>(
    api: &A,
    records: &[RenewalRecord],
    now: u64,
    dry_run: bool,
) -> RenewStats {
    let mut stats = RenewStats::default();

    for record in records {
        stats.checked += 1;
        match try_renew_one(api, record, now, dry_run).await {
            Ok(Some(tx_hash)) => {
                stats.renewed += 1;
                tracing::info!(
                    user = ?record.user,
                    subscription = ?record.subscription,
                    tx = ?tx_hash,
                    "auto-renew submitted"
                );
            }
            Ok(None) => {
                stats.skipped += 1;
            }
            Err(err) => {
                stats.failed += 1;
                tracing::warn!(
                    user = ?record.user,
                    subscription = ?record.subscription,
                    error = %err,
                    "renewal attempt failed; will retry next cycle"
                );
            }
        }
    }

    stats
}

/// Check-and-renew for one user. `Ok(None)` means ineligible or dry-run.
async fn try_renew_one<A: SubscriptionApi>(
    api: &A,
    record: &RenewalRecord,
    now: u64,
    dry_run: bool,
) -> Result<Option<H256>> {
    let sub = api.subscription(record.subscription, record.user).await?;
    let auth = api.renewal_auth(record.subscription, record.user).await?;

    let reasons = skip_reasons(now, &sub, &auth);
    if !reasons.is_empty() {
        let reasons: Vec<String> = reasons.iter().map(|r| r.to_string()).collect();
        tracing::debug!(
            user = ?record.user,
            active = sub.is_active,
            enabled = auth.is_enabled,
            start_time = sub.start_time,
            end_time = sub.end_time,
            renewals_count = sub.renewals_count,
            remaining = auth.remaining_renewals,
            max_renewals = auth.max_renewals,
            max_price = %auth.max_price,
            authorized_at = auth.authorized_at,
            now,
            reasons = %reasons.join(", "),
            "skipping user"
        );
        return Ok(None);
    }

    if dry_run {
        tracing::info!(
            user = ?record.user,
            subscription = ?record.subscription,
            remaining = auth.remaining_renewals,
            "DRY RUN: would call autoRenew()"
        );
        return Ok(None);
    }

    tracing::info!(
        user = ?record.user,
        subscription = ?record.subscription,
        remaining = auth.remaining_renewals,
        "auto renewing"
    );
    let tx_hash = api.auto_renew(record.subscription, record.user).await?;
    Ok(Some(tx_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn active_sub(end_time: u64) -> SubscriptionView {
        SubscriptionView {
            start_time: 0,
            end_time,
            is_active: true,
            renewals_count: 1,
        }
    }

    fn enabled_auth(remaining: u32) -> RenewalAuth {
        RenewalAuth {
            is_enabled: true,
            max_renewals: 10,
            remaining_renewals: remaining,
            max_price: U256::from(100u64),
            authorized_at: 0,
        }
    }

    #[test]
    fn eligible_only_when_all_four_conditions_hold() {
        let now = 1001;
        assert!(skip_reasons(now, &active_sub(1000), &enabled_auth(1)).is_empty());

        let mut inactive = active_sub(1000);
        inactive.is_active = false;
        assert_eq!(
            skip_reasons(now, &inactive, &enabled_auth(1)),
            vec![SkipReason::SubscriptionInactive]
        );

        let mut off = enabled_auth(1);
        off.is_enabled = false;
        assert_eq!(
            skip_reasons(now, &active_sub(1000), &off),
            vec![SkipReason::AutoRenewDisabled]
        );

        assert_eq!(
            skip_reasons(now, &active_sub(2000), &enabled_auth(1)),
            vec![SkipReason::NotYetDue]
        );

        assert_eq!(
            skip_reasons(now, &active_sub(1000), &enabled_auth(0)),
            vec![SkipReason::NoRenewalsRemaining]
        );
    }

    #[test]
    fn end_time_comparison_is_strict() {
        // Ending exactly now is not yet due.
        assert_eq!(
            skip_reasons(1000, &active_sub(1000), &enabled_auth(1)),
            vec![SkipReason::NotYetDue]
        );
        assert!(skip_reasons(1001, &active_sub(1000), &enabled_auth(1)).is_empty());
    }

    struct MockApi {
        subs: BTreeMap<Address, SubscriptionView>,
        auths: BTreeMap<Address, RenewalAuth>,
        read_fails: Vec<Address>,
        submit_fails: Vec<Address>,
        submitted: Mutex<Vec<Address>>,
    }

    impl MockApi {
        fn new() -> Self {
            Self {
                subs: BTreeMap::new(),
                auths: BTreeMap::new(),
                read_fails: Vec::new(),
                submit_fails: Vec::new(),
                submitted: Mutex::new(Vec::new()),
            }
        }

        fn with_user(mut self, user: Address, sub: SubscriptionView, auth: RenewalAuth) -> Self {
            self.subs.insert(user, sub);
            self.auths.insert(user, auth);
            self
        }

        fn submitted(&self) -> Vec<Address> {
            self.submitted.lock().unwrap().clone()
        }
    }

    impl SubscriptionApi for MockApi {
        async fn subscription(&self, _contract: Address, user: Address) -> Result<SubscriptionView> {
            if self.read_fails.contains(&user) {
                return Err(eyre!("rpc error"));
            }
            self.subs
                .get(&user)
                .copied()
                .ok_or_else(|| eyre!("unknown user"))
        }

        async fn renewal_auth(&self, _contract: Address, user: Address) -> Result<RenewalAuth> {
            self.auths
                .get(&user)
                .copied()
                .ok_or_else(|| eyre!("unknown user"))
        }

        async fn auto_renew(&self, _contract: Address, user: Address) -> Result<H256> {
            if self.submit_fails.contains(&user) {
                return Err(eyre!("execution reverted"));
            }
            self.submitted.lock().unwrap().push(user);
            Ok(H256::from_low_u64_be(user.to_low_u64_be()))
        }
    }

    fn record(user: Address) -> RenewalRecord {
        RenewalRecord {
            user,
            plan_id: U256::from(1u64),
            subscription: Address::from_low_u64_be(0x5ab),
            remaining_renewals: Some(1),
        }
    }

    #[tokio::test]
    async fn due_user_gets_exactly_one_renewal() {
        let a = Address::from_low_u64_be(1);
        let api = MockApi::new().with_user(a, active_sub(1000), enabled_auth(1));

        let stats = renew_due(&api, &[record(a)], 1001, false).await;

        assert_eq!(stats.renewed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(api.submitted(), vec![a]);
    }

    #[tokio::test]
    async fn zero_remaining_skips_without_error() {
        let a = Address::from_low_u64_be(1);
        let api = MockApi::new().with_user(a, active_sub(1000), enabled_auth(0));

        let stats = renew_due(&api, &[record(a)], 1001, false).await;

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.renewed, 0);
        assert_eq!(stats.failed, 0);
        assert!(api.submitted().is_empty());
    }

    #[tokio::test]
    async fn failing_user_does_not_block_the_rest() {
        let bad = Address::from_low_u64_be(1);
        let good = Address::from_low_u64_be(2);
        let mut api = MockApi::new()
            .with_user(bad, active_sub(1000), enabled_auth(1))
            .with_user(good, active_sub(1000), enabled_auth(1));
        api.submit_fails.push(bad);

        let stats = renew_due(&api, &[record(bad), record(good)], 1001, false).await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.renewed, 1);
        assert_eq!(api.submitted(), vec![good]);
    }

    #[tokio::test]
    async fn read_failure_is_isolated_per_user() {
        let bad = Address::from_low_u64_be(1);
        let good = Address::from_low_u64_be(2);
        let mut api = MockApi::new()
            .with_user(bad, active_sub(1000), enabled_auth(1))
            .with_user(good, active_sub(1000), enabled_auth(1));
        api.read_fails.push(bad);

        let stats = renew_due(&api, &[record(bad), record(good)], 1001, false).await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.renewed, 1);
        assert_eq!(api.submitted(), vec![good]);
    }

    #[tokio::test]
    async fn dry_run_submits_nothing() {
        let a = Address::from_low_u64_be(1);
        let api = MockApi::new().with_user(a, active_sub(1000), enabled_auth(1));

        let stats = renew_due(&api, &[record(a)], 1001, true).await;

        assert_eq!(stats.skipped, 1);
        assert!(api.submitted().is_empty());
    }
}
