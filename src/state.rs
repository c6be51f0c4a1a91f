use crate::store::RenewalStore;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Durable keeper state: scan cursor plus the reconciled renewal records.
///
/// Owned by main and passed into the cycle function; there is no module-level
/// global. Persisted after each fully successful cycle so a restart resumes
/// from the last checkpoint instead of a hardcoded block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeeperState {
    /// The highest block number fully scanned for AutoRenewal* events across
    /// all tracked subscription contracts.
    pub last_scanned_block: u64,

    /// user -> renewal record, rebuilt from events.
    #[serde(default)]
    pub renewals: RenewalStore,
}

impl KeeperState {
    pub fn load_or_init(path: impl AsRef<Path>, start_block: u64) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| eyre!("failed to read state file {}: {e}", path.display()))?;
            let st: KeeperState = serde_json::from_str(&raw)
                .map_err(|e| eyre!("failed to parse state file {}: {e}", path.display()))?;
            return Ok(st);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }

        let init = KeeperState {
            last_scanned_block: start_block,
            renewals: RenewalStore::new(),
        };
        init.save(path)?;
        Ok(init)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| eyre!("failed to serialize keeper state: {e}"))?;

        // Atomic-ish write: write to a temp file then rename.
        // This reduces the chance of a corrupted state file if the process is interrupted.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| {
            eyre!(
                "failed to write temp state file {}: {e}",
                tmp_path.display()
            )
        })?;

        // Atomic-ish replace:
        // - On Unix, rename replaces the destination if it exists.
        // - On Windows, rename fails if the destination exists; in that case we remove then rename.
        if let Err(err) = fs::rename(&tmp_path, path) {
            if cfg!(windows) {
                let _ = fs::remove_file(path);
                fs::rename(&tmp_path, path)
                    .map_err(|e| eyre!("failed to replace state file {}: {e}", path.display()))?;
            } else {
                return Err(eyre!(
                    "failed to replace state file {}: {err}",
                    path.display()
                ));
            }
        }
        Ok(())
    }

    /// Move the scan cursor forward. The cursor never regresses, even if a
    /// provider briefly reports an older head.
    pub fn advance_cursor(&mut self, to_block: u64) {
        if to_block > self.last_scanned_block {
            self.last_scanned_block = to_block;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RenewalRecord;
    use ethers::types::{Address, U256};

    #[test]
    fn cursor_never_decreases() {
        let mut st = KeeperState {
            last_scanned_block: 100,
            renewals: RenewalStore::new(),
        };
        st.advance_cursor(90);
        assert_eq!(st.last_scanned_block, 100);
        st.advance_cursor(150);
        assert_eq!(st.last_scanned_block, 150);
        st.advance_cursor(150);
        assert_eq!(st.last_scanned_block, 150);
    }

    #[test]
    fn load_or_init_seeds_from_start_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let st = KeeperState::load_or_init(&path, 2_128_618).unwrap();
        assert_eq!(st.last_scanned_block, 2_128_618);
        assert!(st.renewals.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn save_then_load_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut st = KeeperState::load_or_init(&path, 10).unwrap();
        st.renewals.set(RenewalRecord {
            user: Address::from_low_u64_be(1),
            plan_id: U256::from(7u64),
            subscription: Address::from_low_u64_be(2),
            remaining_renewals: Some(4),
        });
        st.advance_cursor(99);
        st.save(&path).unwrap();

        let loaded = KeeperState::load_or_init(&path, 10).unwrap();
        assert_eq!(loaded.last_scanned_block, 99);
        assert_eq!(
            loaded
                .renewals
                .get(&Address::from_low_u64_be(1))
                .unwrap()
                .remaining_renewals,
            Some(4)
        );
    }
}
