use crate::events::{self, RenewalEvent};
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, Filter, Log, Topic, ValueOrArray};
use eyre::{eyre, Result};
use std::cmp;
use std::time::Duration;

/// Fetch and decode all AutoRenewal* events for one subscription contract over
/// the inclusive range `[from_block, to_block]`.
///
/// This is fetch-and-decode only: the poll cycle applies the returned batch to
/// the store after *every* plan has scanned cleanly, so a mid-scan failure in
/// any plan leaves both the store and the cursor untouched.
///
/// Events are returned in chain-delivery order (block, then log index); no
/// reordering or deduplication. A log carrying one of the tracked selectors
/// but a malformed payload is logged and dropped rather than misread.
pub async fn scan_renewal_events<M: Middleware>(
    client: &M,
    subscription: Address,
    from_block: u64,
    to_block: u64,
    log_chunk_size: u64,
) -> Result<Vec<RenewalEvent>>
where
    M::Error: 'static,
{
    if from_block > to_block {
        return Err(eyre!(
            "invalid scan range: from({from_block}) > to({to_block})"
        ));
    }

    // One filter matches any of the three selectors in the topic0 slot.
    let topic0: Topic = ValueOrArray::Array(vec![
        Some(events::enabled_topic0()),
        Some(events::disabled_topic0()),
        Some(events::executed_topic0()),
    ]);

    let mut out = Vec::new();
    let mut chunk = log_chunk_size.max(1);
    let mut cursor = from_block;

    tracing::debug!(
        subscription = ?subscription,
        from = from_block,
        to = to_block,
        chunk,
        "scanning for AutoRenewal logs"
    );

    while cursor <= to_block {
        let end = cmp::min(cursor.saturating_add(chunk - 1), to_block);

        // We may need to shrink the chunk size if the RPC rejects large ranges.
        let logs = match fetch_logs_with_retries(client, subscription, topic0.clone(), cursor, end)
            .await
        {
            Ok(logs) => logs,
            Err(err) => {
                // Shrink range and retry (down to 10-block chunks).
                if chunk <= 10 {
                    return Err(err);
                }
                chunk = cmp::max(10, chunk / 2);
                tracing::warn!(
                    cursor,
                    end,
                    chunk,
                    "log fetch failed; reducing chunk size and retrying"
                );
                continue;
            }
        };

        for log in logs {
            match events::decode_renewal_event(&log) {
                Ok(Some(event)) => out.push(event),
                Ok(None) => {
                    // Not one of the three tracked kinds; ignore.
                }
                Err(err) => {
                    tracing::warn!(
                        subscription = ?subscription,
                        block = log.block_number.map(|b| b.as_u64()),
                        tx = ?log.transaction_hash,
                        error = %err,
                        "rejecting malformed AutoRenewal event"
                    );
                }
            }
        }

        cursor = end.saturating_add(1);
    }

    tracing::debug!(
        subscription = ?subscription,
        decoded = out.len(),
        to = to_block,
        "scan complete"
    );

    Ok(out)
}

async fn fetch_logs_with_retries<M: Middleware>(
    client: &M,
    subscription: Address,
    topic0: Topic,
    from: u64,
    to: u64,
) -> Result<Vec<Log>>
where
    M::Error: 'static,
{
    let filter = Filter::new()
        .address(subscription)
        .topic0(topic0)
        .from_block(BlockNumber::Number(from.into()))
        .to_block(BlockNumber::Number(to.into()));

    // A few quick retries with exponential backoff help with flaky / rate-limited RPCs.
    let mut delay = Duration::from_millis(200);

    for attempt in 1..=3 {
        match client.get_logs(&filter).await {
            Ok(logs) => return Ok(logs),
            Err(err) => {
                if attempt == 3 {
                    return Err(err.into());
                }
                tracing::warn!(
                    attempt,
                    from,
                    to,
                    sleep_ms = delay.as_millis() as u64,
                    error = %err,
                    "getLogs failed; retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }

    Err(eyre!("unreachable"))
}
