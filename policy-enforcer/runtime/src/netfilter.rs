use crate::{
    core::names,
    exec::{self, Exec, ExecError, MissingTool, Process},
    ipset::{Ipset, SetError},
    iptables::{IpTables, ParseError},
};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Reads and writes the kernel's packet filter state through `iptables-save`,
/// `iptables-restore` and `ipset`.
#[derive(Clone, Debug)]
pub struct Netfilter<E> {
    exec: E,
    iptables_save: PathBuf,
    iptables_restore: PathBuf,
    ipset: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("invalid iptables-save output: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Sets(#[from] SetError),
}

// === impl Netfilter ===

impl Netfilter<Process> {
    pub fn new() -> Result<Self, MissingTool> {
        Self::with_exec(Process::default())
    }
}

impl<E: Exec> Netfilter<E> {
    /// Resolves every required tool on `PATH`, failing if any is missing.
    pub fn with_exec(exec: E) -> Result<Self, MissingTool> {
        Ok(Self {
            iptables_save: exec::lookup("iptables-save")?,
            iptables_restore: exec::lookup("iptables-restore")?,
            ipset: exec::lookup("ipset")?,
            exec,
        })
    }

    pub fn with_paths(
        exec: E,
        iptables_save: impl Into<PathBuf>,
        iptables_restore: impl Into<PathBuf>,
        ipset: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exec,
            iptables_save: iptables_save.into(),
            iptables_restore: iptables_restore.into(),
            ipset: ipset.into(),
        }
    }

    /// Reads the live `filter` table.
    pub async fn load_iptables(&self) -> Result<IpTables, LoadError> {
        let saved = self
            .exec
            .exec(&self.iptables_save, &["-t", "filter"], None)
            .await?;
        Ok(saved.parse()?)
    }

    /// Checks that the kernel would accept `rules` without applying them.
    pub async fn validate(&self, rules: &IpTables) -> Result<(), ExecError> {
        self.exec
            .exec(
                &self.iptables_restore,
                &["--noflush", "--test"],
                Some(&rules.render()),
            )
            .await?;
        Ok(())
    }

    /// Atomically applies `rules`. Chains that are not part of the rendering are left untouched.
    pub async fn apply_iptables(&self, rules: &IpTables) -> Result<(), ExecError> {
        self.exec
            .exec(&self.iptables_restore, &["--noflush"], Some(&rules.render()))
            .await?;
        Ok(())
    }

    /// Reads the live managed sets. Sets owned by anything else are ignored.
    pub async fn load_ipsets(&self) -> Result<Ipset, LoadError> {
        let saved = self.exec.exec(&self.ipset, &["save"], None).await?;
        Ok(Ipset::from_save(&saved, names::is_managed)?)
    }

    /// Brings the kernel's sets in line with `desired`.
    ///
    /// Returns the managed sets that are no longer desired. They can't be destroyed until no rule
    /// references them.
    pub async fn apply_ipsets(&self, desired: &Ipset) -> Result<Vec<String>, LoadError> {
        let live = self.load_ipsets().await?;
        let diff = desired.diff(&live, names::is_managed)?;
        if diff.is_empty() {
            debug!("ipsets are up to date");
        } else {
            debug!(commands = diff.commands.len(), "Updating ipsets");
            self.exec
                .exec(&self.ipset, &["restore", "-exist"], Some(&diff.script()))
                .await?;
        }
        Ok(diff.stale)
    }

    /// Destroys the named sets. Failures are logged and otherwise ignored.
    pub async fn destroy_ipsets(&self, sets: &[String]) {
        for set in sets {
            match self.exec.exec(&self.ipset, &["destroy", set.as_str()], None).await {
                Ok(_) => debug!(%set, "Destroyed stale ipset"),
                Err(error) => warn!(%set, %error, "Failed to destroy stale ipset"),
            }
        }
    }
}
