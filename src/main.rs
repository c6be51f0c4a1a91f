mod config;
mod contracts;
mod cycle;
mod deployments;
mod events;
mod renewer;
mod scanner;
mod state;
mod store;

use clap::Parser;
use config::KeeperConfig;
use contracts::SubraFactory;
use deployments::DeploymentArtifact;
use ethers::middleware::NonceManagerMiddleware;
use ethers::prelude::{Http, LocalWallet, Provider, SignerMiddleware};
use ethers::providers::Middleware;
use ethers::signers::Signer;
use eyre::{eyre, Result};
use renewer::SubscriptionClient;
use state::KeeperState;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

/// Persist state after a successful cycle. A failed write is logged and
/// retried next tick; in-memory state stays authoritative either way, so a
/// transient filesystem error must not take the keeper down.
fn persist_state(state: &KeeperState, path: &Path) {
    if let Err(err) = state.save(path) {
        tracing::error!(
            error = %err,
            path = %path.display(),
            "failed to persist keeper state; will retry next cycle"
        );
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "subra-keeper",
    version,
    about = "Subra auto-renewal keeper bot (Rust)"
)]
struct Args {
    /// Path to a deployment artifact JSON (e.g., deployments/mainnet.json)
    #[arg(long, default_value = "deployments/mainnet.json")]
    deployment: PathBuf,

    /// Override RPC URL. If omitted, uses SUBRA_KEEPER_RPC_URL or deployment.rpc.
    #[arg(long)]
    rpc_url: Option<String>,

    /// Environment variable name that contains the keeper's private key.
    #[arg(long, default_value = "KEEPER_PRIVATE_KEY")]
    private_key_env: String,

    /// Polling interval in seconds.
    #[arg(long, default_value_t = 60)]
    poll_seconds: u64,

    /// Block confirmations to wait before scanning logs.
    #[arg(long, default_value_t = 1)]
    confirmations: u64,

    /// Log scan chunk size (blocks per eth_getLogs request).
    #[arg(long, default_value_t = 500)]
    log_chunk: u64,

    /// Where to store keeper state (last scanned block, renewal records).
    #[arg(long, default_value = "state/state.json")]
    state_file: PathBuf,

    /// Run a single scan+renew cycle and exit.
    #[arg(long)]
    once: bool,

    /// Don't send transactions; only print what would be done.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let deployment = DeploymentArtifact::load(&args.deployment)?;

    let cfg = KeeperConfig::from_cli_and_deployment(
        &deployment,
        args.rpc_url,
        args.private_key_env,
        args.poll_seconds,
        args.log_chunk,
        args.confirmations,
        args.state_file,
        args.once,
        args.dry_run,
    )?;

    let private_key = std::env::var(&cfg.private_key_env).map_err(|_| {
        eyre!(
            "missing private key env var '{}'. Set it in your shell before running.",
            cfg.private_key_env
        )
    })?;

    let wallet: LocalWallet = private_key
        .parse::<LocalWallet>()
        .map_err(|e| eyre!("invalid private key in {}: {e}", cfg.private_key_env))?
        .with_chain_id(cfg.chain_id);

    // Provider + signer.
    let provider =
        Provider::<Http>::try_from(cfg.rpc_url.as_str())?.interval(Duration::from_millis(800));

    // Hard safety check: ensure we're connected to the expected chain.
    let remote_chain_id = provider.get_chainid().await?.as_u64();
    if remote_chain_id != cfg.chain_id {
        return Err(eyre!(
            "RPC chainId mismatch: deployment expects {}, but RPC reports {}. Refusing to run.",
            cfg.chain_id,
            remote_chain_id
        ));
    }

    // Ensure the factory has code at the configured address.
    let code = provider.get_code(cfg.factory, None).await?;
    if code.0.is_empty() {
        return Err(eyre!(
            "no contract code found at factory address {:?}. Check deployments JSON and RPC.",
            cfg.factory
        ));
    }

    let signer = SignerMiddleware::new(provider, wallet.clone());
    let client = NonceManagerMiddleware::new(signer, wallet.address());
    let client = Arc::new(client);

    // Ensure the state directory exists before we create/lock the lockfile.
    //
    // Without this, a first-time run can fail when the state parent directory
    // (e.g. state/) does not yet exist.
    if let Some(parent) = cfg.state_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }
    }

    // Single-instance guard: lock alongside the state file.
    // This prevents two keepers from running concurrently with the same signer/state.
    let lock_path = cfg.state_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "keeper already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    // One-time startup head fetch. Failing here is fatal: without a head we
    // cannot seed the scan cursor.
    let head = client.get_block_number().await?.as_u64();
    let seed_block = cfg
        .start_block
        .unwrap_or_else(|| head.saturating_sub(cfg.backfill_window));

    tracing::info!(
        chain_id = cfg.chain_id,
        factory = ?cfg.factory,
        seed_block,
        signer = ?wallet.address(),
        dry_run = cfg.dry_run,
        once = cfg.once,
        "keeper starting"
    );

    let mut state = KeeperState::load_or_init(&cfg.state_file, seed_block)?;

    let factory = SubraFactory::new(cfg.factory, client.clone());
    let api = SubscriptionClient::new(client.clone());

    // One cycle at a time: the await below structurally prevents a new tick
    // from firing while a slow cycle is still in flight.
    loop {
        let now = now_unix();
        let outcome = cycle::run_cycle(
            client.as_ref(),
            &factory,
            &api,
            cfg.log_chunk_size,
            cfg.confirmations,
            now,
            cfg.dry_run,
            &mut state,
        )
        .await;

        match outcome {
            Ok(report) => {
                // Persist cursor + records only after a fully successful cycle.
                persist_state(&state, &cfg.state_file);
                tracing::info!(
                    scanned_to = report.scanned_to,
                    plans = report.plans,
                    events = report.events,
                    tracked = report.tracked,
                    renewed = report.renew.renewed,
                    skipped = report.renew.skipped,
                    failed = report.renew.failed,
                    "cycle complete"
                );
            }
            Err(err) => {
                // A bad cycle never kills the keeper; the cursor was not
                // advanced, so the same range is rescanned next tick.
                tracing::error!(error = %err, "keeper cycle failed; will retry next tick");
            }
        }

        if cfg.once {
            break;
        }

        tokio::time::sleep(cfg.poll_interval).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RenewalStore;

    #[test]
    fn persist_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let state = KeeperState {
            last_scanned_block: 42,
            renewals: RenewalStore::new(),
        };

        // The state path's parent is a regular file, so the underlying save
        // must fail; the helper logs and returns instead of propagating.
        persist_state(&state, &blocker.join("state.json"));
    }
}
