use crate::{
    core::{BlocksSnapshot, Scheme},
    enforcer::{Config, Enforcer},
    metrics::EnforcerMetrics,
    netfilter::Netfilter,
    source::{FileSource, PolicyStore},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::path::PathBuf;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

// Policy notifications carry no data, so a single pending one covers any number of changes.
const POLICY_UPDATES_QUEUE_SIZE: usize = 1;
const BLOCK_UPDATES_QUEUE_SIZE: usize = 16;

#[derive(Debug, Parser)]
#[clap(
    name = "policy-enforcer",
    about = "Enforces network policies with ipsets and iptables"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "romana=info,warn",
        env = "ROMANA_ENFORCER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Name of this host, as recorded in block assignments.
    #[clap(long, env = "HOSTNAME")]
    hostname: String,

    /// Seconds between reconciliations.
    #[clap(long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    refresh_interval: u64,

    /// Either `policy-on-top` or `target-on-top`.
    #[clap(long, default_value = "policy-on-top")]
    translation_scheme: Scheme,

    /// A JSON list of policies.
    #[clap(long)]
    policies: PathBuf,

    /// A JSON block assignment snapshot.
    #[clap(long)]
    blocks: PathBuf,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin,
            hostname,
            refresh_interval,
            translation_scheme,
            policies,
            blocks,
        } = self;

        log_format.try_init(log_level)?;

        let mut prom = <Registry>::default();
        let metrics = EnforcerMetrics::register(prom.sub_registry_with_prefix("romana_enforcer"));

        // Fail before serving anything if the host lacks the tools we drive.
        let netfilter = Netfilter::new()?;

        let _admin = admin.into_builder().with_prometheus(prom).bind()?.spawn();
        let (shutdown, watch) = kubert::shutdown::sigint_or_sigterm()?;

        let interval = Duration::from_secs(refresh_interval);
        let store = PolicyStore::default();
        let (policy_tx, policy_rx) = mpsc::channel(POLICY_UPDATES_QUEUE_SIZE);
        let (blocks_tx, blocks_rx) = mpsc::channel(BLOCK_UPDATES_QUEUE_SIZE);

        let source = FileSource::new(
            policies,
            blocks,
            interval,
            store.clone(),
            policy_tx,
            blocks_tx,
        );
        tokio::spawn(source.run().instrument(info_span!("source")));

        let enforcer = Enforcer::new(
            Config {
                hostname,
                interval,
                scheme: translation_scheme,
            },
            store,
            policy_rx,
            BlocksSnapshot::default(),
            blocks_rx,
            netfilter,
            metrics,
        );
        let task = enforcer.spawn(async move {
            drop(watch.signaled().await);
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the enforcer to
        // finish its current reconciliation before exiting.
        if shutdown.signaled().await.is_err() {
            bail!("Aborted");
        }
        task.await?;
        info!("Shut down");

        Ok(())
    }
}
