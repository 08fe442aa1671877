//! The reconciliation loop.
//!
//! The enforcer consumes one event at a time: block snapshots and policy notifications only mark
//! the state dirty, and the periodic tick renders and applies everything at once. Updates that
//! arrive between ticks are thereby coalesced, and reconciliations never overlap.

use crate::{
    cleanup,
    core::{Block, BlocksSnapshot, PolicyCache, Scheme},
    exec::Exec,
    metrics::{EnforcerMetrics, ErrorKind},
    netfilter::Netfilter,
    sets,
    translate::{self, Rendered},
};
use std::future::Future;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

#[derive(Clone, Debug)]
pub struct Config {
    /// Name of the current host. Blocks owned by this host are local.
    pub hostname: String,

    /// Time between reconciliation attempts.
    pub interval: Duration,

    pub scheme: Scheme,
}

pub struct Enforcer<C, E> {
    policy_updates: mpsc::Receiver<()>,
    block_updates: mpsc::Receiver<BlocksSnapshot>,
    interval: Duration,
    state: State<C, E>,
}

struct State<C, E> {
    policies: C,
    blocks: Vec<Block>,
    hostname: String,
    scheme: Scheme,
    netfilter: Netfilter<E>,
    metrics: EnforcerMetrics,
    policies_dirty: bool,
    blocks_dirty: bool,
}

/// How a reconciliation ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Outcome {
    Applied,

    /// The inputs could not be rendered. Nothing changes until the inputs do.
    Rejected,

    /// The kernel refused the rendered state. The same inputs are tried again.
    Failed,
}

// === impl Enforcer ===

impl<C, E> Enforcer<C, E>
where
    C: PolicyCache + Send + 'static,
    E: Exec + 'static,
{
    pub fn new(
        config: Config,
        policies: C,
        policy_updates: mpsc::Receiver<()>,
        blocks: BlocksSnapshot,
        block_updates: mpsc::Receiver<BlocksSnapshot>,
        netfilter: Netfilter<E>,
        metrics: EnforcerMetrics,
    ) -> Self {
        let Config {
            hostname,
            interval,
            scheme,
        } = config;
        Self {
            policy_updates,
            block_updates,
            interval,
            state: State {
                policies,
                blocks: blocks.blocks,
                hostname,
                scheme,
                netfilter,
                metrics,
                policies_dirty: false,
                blocks_dirty: false,
            },
        }
    }

    /// Starts the loop in the background. It runs until `shutdown` completes.
    pub fn spawn<F>(self, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.run(shutdown).instrument(info_span!("enforcer")))
    }

    async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            mut policy_updates,
            mut block_updates,
            interval,
            mut state,
        } = self;
        tokio::pin!(shutdown);

        let mut ticks = time::interval_at(Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut policies_open = true;
        let mut blocks_open = true;
        info!(hostname = %state.hostname, scheme = %state.scheme, ?interval, "Policy enforcer started");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Policy enforcer stopping");
                    return;
                }

                update = block_updates.recv(), if blocks_open => match update {
                    Some(snapshot) => state.update_blocks(snapshot),
                    None => {
                        debug!("Block updates closed");
                        blocks_open = false;
                    }
                },

                update = policy_updates.recv(), if policies_open => match update {
                    Some(()) => {
                        debug!("Policies updated");
                        state.policies_dirty = true;
                    }
                    None => {
                        debug!("Policy updates closed");
                        policies_open = false;
                    }
                },

                _ = ticks.tick() => state.tick().await,
            }
        }
    }
}

// === impl State ===

impl<C: PolicyCache, E: Exec> State<C, E> {
    fn update_blocks(&mut self, snapshot: BlocksSnapshot) {
        debug!(revision = snapshot.revision, blocks = snapshot.blocks.len(), "Blocks updated");
        self.blocks = snapshot.blocks;
        self.blocks_dirty = true;
    }

    async fn tick(&mut self) {
        if !self.policies_dirty && !self.blocks_dirty {
            trace!("No updates, skipping");
            return;
        }
        if self.blocks.is_empty() {
            trace!("No blocks, skipping");
            return;
        }

        self.metrics.ticks.inc();
        let outcome = self.reconcile().await;
        debug!(?outcome, "Reconciled");
        if outcome != Outcome::Failed {
            self.policies_dirty = false;
            self.blocks_dirty = false;
        }
    }

    async fn reconcile(&mut self) -> Outcome {
        let policies = self.policies.list();

        let sets = match sets::build(&policies, &self.blocks, &self.hostname) {
            Ok(sets) => sets,
            Err(error) => {
                error!(%error, "Failed to make ipsets, can't apply policies");
                self.metrics.error(ErrorKind::MakeSets);
                return Outcome::Rejected;
            }
        };

        let stale = match self.netfilter.apply_ipsets(&sets).await {
            Ok(stale) => stale,
            Err(error) => {
                error!(%error, "Failed to update ipsets, can't apply policies");
                self.metrics.error(ErrorKind::ApplySets);
                return Outcome::Failed;
            }
        };
        self.metrics.block_updates.inc();
        self.metrics.managed_sets.set(sets.len() as i64);

        let Rendered {
            mut iptables,
            rules,
            errors,
        } = translate::render(&policies, &self.blocks, &self.hostname, self.scheme);
        for error in &errors {
            warn!(%error, "Skipped policy rule");
            self.metrics.error(ErrorKind::Translate);
        }
        self.metrics.policy_rules.set(rules as i64);

        match self.netfilter.load_iptables().await {
            Ok(live) => {
                let orphans = cleanup::cleanup(&mut iptables, &live);
                if !orphans.is_empty() {
                    info!(chains = ?orphans, "Removing unused chains");
                }
            }
            Err(error) => {
                warn!(%error, "Failed to load current iptables, can't remove old chains");
                self.metrics.error(ErrorKind::LoadIptables);
                cleanup::withhold_inserts(&mut iptables);
            }
        }

        if let Err(error) = self.netfilter.validate(&iptables).await {
            error!(%error, "Failed to validate iptables");
            debug!(rules = %iptables.render(), "Rejected iptables");
            self.metrics.error(ErrorKind::ValidateIptables);
            return Outcome::Failed;
        }

        if let Err(error) = self.netfilter.apply_iptables(&iptables).await {
            error!(%error, "iptables-restore failed");
            self.metrics.error(ErrorKind::ApplyIptables);
            return Outcome::Failed;
        }
        self.metrics.policy_updates.inc();
        info!(sets = sets.len(), rules, "Applied policies");
        trace!(rules = %iptables.render(), "Applied iptables");

        self.netfilter.destroy_ipsets(&stale).await;
        Outcome::Applied
    }
}
