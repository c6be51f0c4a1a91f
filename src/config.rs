use crate::deployments::DeploymentArtifact;
use ethers::types::Address;
use eyre::{eyre, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

/// Blocks to backfill on first run when the artifact carries no startBlock.
const DEFAULT_BACKFILL_WINDOW: u64 = 100;

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub factory: Address,

    /// Checkpoint to seed a fresh cursor from; `None` means seed from
    /// `latest - backfill_window` after the startup head fetch.
    pub start_block: Option<u64>,
    pub backfill_window: u64,

    pub poll_interval: Duration,
    pub log_chunk_size: u64,
    pub confirmations: u64,

    pub state_file: PathBuf,

    pub private_key_env: String,

    pub once: bool,
    pub dry_run: bool,
}

impl KeeperConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli_and_deployment(
        deployment: &DeploymentArtifact,
        rpc_override: Option<String>,
        private_key_env: String,
        poll_seconds: u64,
        log_chunk: u64,
        confirmations: u64,
        state_file: PathBuf,
        once: bool,
        dry_run: bool,
    ) -> Result<Self> {
        let rpc_url = rpc_override
            .or_else(|| std::env::var("SUBRA_KEEPER_RPC_URL").ok())
            .or_else(|| {
                deployment
                    .rpc_env_var
                    .as_ref()
                    .and_then(|k| std::env::var(k).ok())
            })
            .or_else(|| deployment.rpc.clone())
            .ok_or_else(|| {
                eyre!(
                    "no rpc url provided. pass --rpc-url, set SUBRA_KEEPER_RPC_URL, set deployment.rpcEnvVar, or include rpc in deployment json"
                )
            })?;

        let factory = Address::from_str(&deployment.subscription_factory).map_err(|e| {
            eyre!(
                "invalid subscriptionFactory address '{}': {e}",
                deployment.subscription_factory
            )
        })?;

        if log_chunk == 0 {
            return Err(eyre!("log chunk size must be > 0"));
        }

        if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
            tracing::warn!("RPC URL looks like it may contain an API key; consider using SUBRA_KEEPER_RPC_URL env instead of committing it.");
        }

        Ok(Self {
            chain_id: deployment.chain_id,
            rpc_url,
            factory,
            start_block: deployment.start_block,
            backfill_window: deployment
                .backfill_window
                .unwrap_or(DEFAULT_BACKFILL_WINDOW)
                .max(1),
            poll_interval: Duration::from_secs(poll_seconds.max(1)),
            log_chunk_size: log_chunk,
            confirmations,
            state_file,
            private_key_env,
            once,
            dry_run,
        })
    }
}
