use crate::contracts::SubraFactory;
use crate::events::RenewalEvent;
use crate::renewer::{self, RenewStats, SubscriptionApi};
use crate::scanner;
use crate::state::KeeperState;
use ethers::providers::Middleware;
use ethers::types::Address;
use eyre::{eyre, Result};

/// Decoded events for one plan's subscription contract, in delivery order.
#[derive(Debug, Clone)]
pub struct PlanBatch {
    pub subscription: Address,
    pub events: Vec<RenewalEvent>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub scanned_to: u64,
    pub plans: usize,
    pub events: usize,
    pub tracked: usize,
    pub renew: RenewStats,
}

/// One scan-and-renew cycle over the owned keeper state.
///
/// Scan results are gathered across all plans before any of them touch the
/// store: if any plan's event query fails, the error propagates out of the
/// cycle with the store and cursor exactly as they were, and the next tick
/// retries the same fromBlock. Only a fully clean gather commits.
#[allow(clippy::too_many_arguments)]
pub async fn run_cycle<M, A>(
    client: &M,
    factory: &SubraFactory<M>,
    api: &A,
    log_chunk_size: u64,
    confirmations: u64,
    now: u64,
    dry_run: bool,
    state: &mut KeeperState,
) -> Result<CycleReport>
where
    M: Middleware + 'static,
    A: SubscriptionApi,
{
    let mut report = CycleReport::default();

    // 1) Head block, minus confirmations to dodge shallow reorgs.
    let latest = client
        .get_block_number()
        .await
        .map_err(|e| eyre!("failed to fetch head block: {e}"))?
        .as_u64();
    let target = latest.saturating_sub(confirmations);

    let from = state.last_scanned_block;

    // 2) Plans are queried fresh each cycle; the factory is the source of truth
    // for which subscription contracts exist.
    let plan_ids = factory
        .get_active_plans()
        .call()
        .await
        .map_err(|e| eyre!("getActivePlans failed: {e}"))?;
    report.plans = plan_ids.len();

    let mut batches = Vec::with_capacity(plan_ids.len());
    if from <= target {
        for plan_id in &plan_ids {
            let subscription = factory
                .get_subscription_contract(*plan_id)
                .call()
                .await
                .map_err(|e| eyre!("getSubscriptionContract({plan_id}) failed: {e}"))?;

            let events =
                scanner::scan_renewal_events(client, subscription, from, target, log_chunk_size)
                    .await?;
            batches.push(PlanBatch {
                subscription,
                events,
            });
        }
    } else {
        tracing::debug!(from, target, "no new blocks to scan");
    }

    // 3) All plans scanned cleanly; apply and advance the cursor.
    report.events = commit_scan(state, &batches, target);
    report.scanned_to = state.last_scanned_block;
    report.tracked = state.renewals.len();

    // 4) Renewal pass over a snapshot of the reconciled records.
    let records = state.renewals.snapshot();
    report.renew = renewer::renew_due(api, &records, now, dry_run).await;

    Ok(report)
}

/// Apply gathered batches to the store in delivery order, then advance the
/// cursor to exactly the toBlock of this scan. Called only after every plan
/// scanned without error.
pub fn commit_scan(state: &mut KeeperState, batches: &[PlanBatch], to_block: u64) -> usize {
    let mut applied = 0;
    for batch in batches {
        for event in &batch.events {
            state.renewals.apply(batch.subscription, event);
            applied += 1;
        }
    }
    state.advance_cursor(to_block);
    applied
}
