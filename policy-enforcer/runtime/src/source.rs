//! File-backed inputs.
//!
//! The control plane publishes the policy list and the block assignment as JSON documents. The
//! source polls both files and forwards changes to the enforcer: policies are stored in a shared
//! [`PolicyStore`] and announced with an empty notification, while every new block assignment is
//! sent as a complete snapshot.

use crate::core::{BlocksSnapshot, Policy, PolicyCache};
use parking_lot::RwLock;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Holds the most recently observed policy list.
#[derive(Clone, Debug, Default)]
pub struct PolicyStore(Arc<RwLock<Vec<Policy>>>);

pub struct FileSource {
    policies_path: PathBuf,
    blocks_path: PathBuf,
    interval: Duration,
    store: PolicyStore,
    policy_tx: mpsc::Sender<()>,
    blocks_tx: mpsc::Sender<BlocksSnapshot>,
    policies_seen: Option<Vec<u8>>,
    blocks_seen: Option<Vec<u8>>,
}

/// The enforcer stopped receiving updates.
#[derive(Debug)]
struct Closed;

// === impl PolicyStore ===

impl PolicyStore {
    pub fn replace(&self, policies: Vec<Policy>) {
        *self.0.write() = policies;
    }
}

impl PolicyCache for PolicyStore {
    fn list(&self) -> Vec<Policy> {
        self.0.read().clone()
    }
}

// === impl FileSource ===

impl FileSource {
    pub fn new(
        policies_path: PathBuf,
        blocks_path: PathBuf,
        interval: Duration,
        store: PolicyStore,
        policy_tx: mpsc::Sender<()>,
        blocks_tx: mpsc::Sender<BlocksSnapshot>,
    ) -> Self {
        Self {
            policies_path,
            blocks_path,
            interval,
            store,
            policy_tx,
            blocks_tx,
            policies_seen: None,
            blocks_seen: None,
        }
    }

    /// Polls both files until the enforcer goes away.
    pub async fn run(mut self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.poll().await.is_err() {
                debug!("Enforcer stopped; no longer polling");
                return;
            }
        }
    }

    async fn poll(&mut self) -> Result<(), Closed> {
        let policies =
            read_changed::<Vec<Policy>>(&self.policies_path, &mut self.policies_seen).await;
        if let Some(policies) = policies {
            info!(policies = policies.len(), "Policies changed");
            self.store.replace(policies);
            match self.policy_tx.try_send(()) {
                // A notification is already pending.
                Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                Err(mpsc::error::TrySendError::Closed(())) => return Err(Closed),
            }
        }

        let snapshot =
            read_changed::<BlocksSnapshot>(&self.blocks_path, &mut self.blocks_seen).await;
        if let Some(snapshot) = snapshot {
            info!(
                revision = snapshot.revision,
                blocks = snapshot.blocks.len(),
                "Blocks changed"
            );
            self.blocks_tx.send(snapshot).await.map_err(|_| Closed)?;
        }

        Ok(())
    }
}

/// Reads `path`, returning its parsed contents only if they differ from the last read.
///
/// Unreadable or malformed documents are logged and otherwise ignored, so the enforcer keeps
/// enforcing the last valid state.
async fn read_changed<T: serde::de::DeserializeOwned>(
    path: &Path,
    seen: &mut Option<Vec<u8>>,
) -> Option<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(path = %path.display(), %error, "Failed to read");
            return None;
        }
    };
    if seen.as_deref() == Some(&bytes[..]) {
        return None;
    }

    let parsed = serde_json::from_slice(&bytes);
    *seen = Some(bytes);
    match parsed {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(path = %path.display(), %error, "Invalid document");
            None
        }
    }
}
