//! Inventory acquisition: a YAML document, or an executable producing the
//! same shape as JSON on stdout. Loads are retried a bounded number of
//! times; a load that never succeeds yields an empty inventory rather than
//! an error, so the agent keeps running on its previous host set.

use crate::hosts::TagList;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// The raw shape of one inventory entry: either the structured table or the
/// legacy whitespace-tags string (where the key doubles as the address).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InventoryEntry {
    Table(RawHost),
    Legacy(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHost {
    pub tags: Option<TagList>,
    pub address: Option<String>,
    pub context: Option<Vec<BTreeMap<String, String>>>,
    pub device_type: Option<String>,
}

pub type Inventory = BTreeMap<String, InventoryEntry>;

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("sharding parameter must look like <id>/<size>, got {0:?}")]
    Malformed(String),

    #[error("shard id {id} is outside 1..={size}")]
    OutOfRange { id: usize, size: usize },
}

/// A `<id>/<size>` shard assignment, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub id: usize,
    pub size: usize,
}

impl ShardSpec {
    /// Parses the CLI parameter. `offset` shifts the id by one, for
    /// schedulers that number their instances from zero.
    pub fn parse(raw: &str, offset: bool) -> Result<ShardSpec, ShardError> {
        let (id, size) = raw
            .split_once('/')
            .ok_or_else(|| ShardError::Malformed(raw.to_string()))?;
        let mut id: usize = id
            .trim()
            .parse()
            .map_err(|_| ShardError::Malformed(raw.to_string()))?;
        let size: usize = size
            .trim()
            .parse()
            .map_err(|_| ShardError::Malformed(raw.to_string()))?;
        if offset {
            id += 1;
        }
        if id == 0 || id > size {
            return Err(ShardError::OutOfRange { id, size });
        }
        Ok(ShardSpec { id, size })
    }
}

/// Keeps only the hosts whose position in sorted key order lands on this
/// shard. The shards of a given size partition any inventory.
pub fn shard_host_list(shard: ShardSpec, inventory: &mut Inventory) {
    let keys: Vec<String> = inventory.keys().cloned().collect();
    for (index, key) in keys.iter().enumerate() {
        if index % shard.size != shard.id - 1 {
            inventory.remove(key);
        }
    }
    tracing::info!(
        shard_id = shard.id,
        shard_size = shard.size,
        hosts = inventory.len(),
        "applied shard filter"
    );
}

/// Where hosts come from, with bounded-retry loading.
#[derive(Debug, Clone)]
pub struct InventorySource {
    path: PathBuf,
    retry: u32,
    retry_interval: Duration,
}

impl InventorySource {
    pub fn new(path: impl Into<PathBuf>) -> InventorySource {
        InventorySource {
            path: path.into(),
            retry: 3,
            retry_interval: Duration::from_secs(5),
        }
    }

    pub fn with_retry(mut self, retry: u32, retry_interval: Duration) -> InventorySource {
        self.retry = retry.max(1);
        self.retry_interval = retry_interval;
        self
    }

    /// Tries the path as YAML first, then as an executable producing JSON.
    /// After the final failed attempt an empty inventory is returned.
    pub fn load(&self) -> Inventory {
        tracing::info!(path = %self.path.display(), "importing inventory");
        for attempt in 1..=self.retry {
            match load_once(&self.path) {
                Ok(inventory) if !inventory.is_empty() => return inventory,
                Ok(_) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        attempt,
                        retry = self.retry,
                        "inventory loaded but empty"
                    );
                }
                Err(reason) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        attempt,
                        retry = self.retry,
                        %reason,
                        "failed to import inventory"
                    );
                }
            }
            if attempt < self.retry {
                std::thread::sleep(self.retry_interval);
            }
        }
        tracing::error!(
            path = %self.path.display(),
            "unable to import inventory after all attempts, giving up"
        );
        Inventory::new()
    }
}

fn load_once(path: &Path) -> Result<Inventory, String> {
    let yaml_failure = match std::fs::read_to_string(path) {
        Ok(raw) => match serde_yaml::from_str::<Inventory>(&raw) {
            Ok(inventory) => return Ok(inventory),
            Err(error) => format!("not a yaml inventory: {}", error),
        },
        Err(error) => format!("unreadable: {}", error),
    };

    // Fall back to treating the path as a dynamic inventory script.
    let output = Command::new("python")
        .arg(path)
        .output()
        .map_err(|error| format!("{}; script failed to run: {}", yaml_failure, error))?;
    if !output.status.success() {
        return Err(format!(
            "{}; script exited with {}: {}",
            yaml_failure,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    serde_json::from_slice::<Inventory>(&output.stdout)
        .map_err(|error| format!("{}; script output is not json: {}", yaml_failure, error))
}
