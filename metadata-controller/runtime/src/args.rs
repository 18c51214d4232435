use crate::{
    core::{TtlCache, DEFAULT_CACHE_PREFIX},
    index::{self, Backoff, CacheConfig, Reconciler, Views, WorkQueue},
    k8s,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::future;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "metadata", about = "A service metadata controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "metadata=info,warn",
        env = "METADATA_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Number of workers taking keys from the queue.
    ///
    /// Node bundles are rebuilt and published one key at a time, so additional workers only
    /// overlap queue handling and retries with an ongoing rebuild.
    #[clap(long, default_value = "2", value_parser = clap::value_parser!(u16).range(1..))]
    workers: u16,

    /// How long a published node bundle remains readable without being refreshed.
    #[clap(long, default_value = "5m", value_parser = parse_duration)]
    cache_ttl: Duration,

    #[clap(long, default_value = DEFAULT_CACHE_PREFIX)]
    cache_prefix: String,

    /// Interval at which every node bundle is rebuilt and republished. Should be shorter
    /// than the cache TTL.
    #[clap(long, default_value = "1m", value_parser = parse_duration)]
    resync_period: Duration,

    /// Maximum time to wait for the initial list of each watched resource.
    #[clap(long, default_value = "60s", value_parser = parse_duration)]
    sync_timeout: Duration,

    /// Consecutive failures after which a key is dropped until it changes again.
    #[clap(long, default_value = "10")]
    max_retries: u32,

    #[clap(long, default_value = "500ms", value_parser = parse_duration)]
    retry_base_delay: Duration,

    #[clap(long, default_value = "60s", value_parser = parse_duration)]
    retry_max_delay: Duration,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            workers,
            cache_ttl,
            cache_prefix,
            resync_period,
            sync_timeout,
            max_retries,
            retry_base_delay,
            retry_max_delay,
        } = self;

        if resync_period >= cache_ttl {
            warn!(
                ?resync_period,
                ?cache_ttl,
                "Bundles may expire before they are refreshed"
            );
        }

        let queue = WorkQueue::new(Backoff {
            base: retry_base_delay,
            max: retry_max_delay,
            max_retries,
        });
        let views = Views::shared(queue.clone());
        let cache = TtlCache::shared();

        let mut prom = <Registry>::default();
        let reconcile_metrics =
            index::ReconcileMetrics::register(prom.sub_registry_with_prefix("reconciler"));
        let queue_metrics =
            index::QueueMetrics::register(prom.sub_registry_with_prefix("work_queue"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches.

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(views.clone(), endpoints)
                .instrument(info_span!("endpoints")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(views.clone(), pods).instrument(info_span!("pods")));

        let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
        tokio::spawn(kubert::index::cluster(views.clone(), nodes).instrument(info_span!("nodes")));

        tokio::spawn(
            cache
                .clone()
                .purge_every(cache_ttl)
                .instrument(info_span!("cache")),
        );

        // Reconciling before every view has been listed would publish incomplete bundles.
        let mut ready = views.read().ready();
        match time::timeout(sync_timeout, ready.wait_for(|synced| *synced)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => bail!("Views closed before syncing"),
            Err(_) => bail!("Views did not sync within {:?}", sync_timeout),
        }

        let reconciler = Arc::new(Reconciler::new(
            views.clone(),
            cache.clone(),
            CacheConfig {
                prefix: cache_prefix.clone().into(),
                ttl: cache_ttl,
            },
            reconcile_metrics,
        ));
        let workers = (0..workers)
            .map(|id| {
                tokio::spawn(
                    index::controller::process(
                        reconciler.clone(),
                        queue.clone(),
                        queue_metrics.clone(),
                    )
                    .instrument(info_span!("worker", id)),
                )
            })
            .collect::<Vec<_>>();
        info!(workers = workers.len(), "Reconciling");

        tokio::spawn(
            index::controller::resync(reconciler, queue.clone(), resync_period)
                .instrument(info_span!("resync")),
        );

        // Once shutdown is signaled, stop accepting keys and hold the runtime open until every
        // worker has finished its in-flight key.
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = shutdown.signaled().await;
            queue.shutdown();
            release.release_after(future::join_all(workers)).await;
            debug!("Workers stopped");
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let offset = s
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("{} does not contain a duration value", s))?;
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude = magnitude.parse::<u64>()?;

    let mul = match unit {
        "" if magnitude == 0 => 0,
        "ms" => 1,
        "s" => 1000,
        "m" => 1000 * 60,
        "h" => 1000 * 60 * 60,
        _ => bail!(
            "invalid duration unit {} (expected one of 'ms', 's', 'm', or 'h')",
            unit
        ),
    };

    let ms = magnitude
        .checked_mul(mul)
        .ok_or_else(|| anyhow::anyhow!("{} overflows when converted to milliseconds", s))?;
    Ok(Duration::from_millis(ms))
}
