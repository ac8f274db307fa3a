//! Agent orchestration.
//!
//! Wires the pipeline together: store pool, schema migrations, taxonomy and
//! customer bulk-loads, the health server, the frame-processing loop and the
//! presence aggregation ticker. The bus consumer itself is external; it
//! attaches through [`Agent::frame_sender`] (the reference binary feeds the
//! channel from stdin).

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::customers::CustomerDirectory;
use crate::export::health::HealthMetrics;
use crate::identity::cache::IdentityCache;
use crate::identity::{self, IdentityResolver};
use crate::ingest::frame::parse_frame;
use crate::ingest::Classifier;
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::presence::{PresenceAggregator, PresencePing};
use crate::store::catalog;
use crate::store::metrics::MetricWriter;
use crate::store::presence::PresenceStore;
use crate::store::StoreWriter;
use crate::taxonomy::TaxonomyRegistry;

/// Agent orchestrates all components of the ingestion pipeline.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Option<StoreWriter>,

    /// Frame channel sender for the bus consumer boundary.
    frame_tx: mpsc::Sender<String>,
    /// Frame channel receiver, taken by `start`.
    frame_rx: Option<mpsc::Receiver<String>>,

    /// Presence ping queue feeding the aggregation ticker.
    ping_tx: mpsc::UnboundedSender<PresencePing>,
    /// Ping queue receiver, taken by `start`.
    ping_rx: Option<mpsc::UnboundedReceiver<PresencePing>>,

    /// Handles for the spawned run loops.
    frame_task: Option<tokio::task::JoinHandle<()>>,
    presence_task: Option<tokio::task::JoinHandle<()>>,

    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let (frame_tx, frame_rx) = mpsc::channel(cfg.pipeline.frame_channel_capacity);
        let (ping_tx, ping_rx) = mpsc::unbounded_channel();

        Ok(Self {
            cfg,
            health,
            store: None,
            frame_tx,
            frame_rx: Some(frame_rx),
            ping_tx,
            ping_rx: Some(ping_rx),
            frame_task: None,
            presence_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the frame channel sender for an external bus consumer.
    pub fn frame_sender(&self) -> mpsc::Sender<String> {
        self.frame_tx.clone()
    }

    /// Enqueues one raw text frame, dropping it if the channel is full.
    pub fn handle_frame(&self, text: String) {
        if self.frame_tx.try_send(text).is_err() {
            self.health
                .frames_dropped
                .with_label_values(&["channel_full"])
                .inc();
            warn!("frame channel full, dropping frame");
        }
    }

    /// Enqueues one presence ping directly (bypassing frame derivation).
    pub fn handle_ping(&self, ping: PresencePing) {
        if self.ping_tx.send(ping).is_ok() {
            self.health.presence_pings.inc();
        }
    }

    /// Start all components and begin ingesting.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server (before migrations so probes respond).
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Open the store pool. Connectivity loss here is the only fatal
        //    condition in the pipeline.
        let mut store = StoreWriter::new(self.cfg.store.clone());
        store.start().await.context("starting store writer")?;
        self.health.store_connected.set(1.0);

        let pool = store
            .pool()
            .context("store pool missing after start")?
            .clone();
        self.store = Some(store);

        // 2. Run migrations if enabled.
        if self.cfg.store.migrations.enabled {
            let migrator = ClickHouseMigrator::new(pool.clone());
            migrator.up().await.context("running migrations")?;
        }

        // 3. Bulk-load the taxonomy and the customer directory.
        let registry = Arc::new(TaxonomyRegistry::new());
        let taxonomy = catalog::load_taxonomy(&pool, &self.cfg.store.database)
            .await
            .context("loading metric taxonomy")?;
        info!(types = taxonomy.len(), "loaded metric taxonomy");
        registry.set_all(taxonomy);
        self.health.taxonomy_types.set(registry.len() as f64);

        let customers = Arc::new(CustomerDirectory::new());
        let customer_rows = catalog::load_customers(&pool, &self.cfg.store.database)
            .await
            .context("loading customer directory")?;
        info!(customers = customer_rows.len(), "loaded customer directory");
        customers.set_all(customer_rows);
        self.health.customers_loaded.set(customers.len() as f64);

        if customers.is_empty() {
            warn!("no customers loaded, every frame will be unattributable");
        }

        // 4. Connect the identity cache. A missing cache degrades region
        //    fallback to "absent entry" instead of failing startup.
        let cache = match IdentityCache::connect(
            &self.cfg.identity.cache_url,
            &self.cfg.identity.cache_hash_key,
        )
        .await
        {
            Ok(cache) => {
                info!(url = %self.cfg.identity.cache_url, "identity cache connected");
                Some(cache)
            }
            Err(e) => {
                warn!(error = %e, "identity cache unavailable, running without fallback");
                None
            }
        };

        let resolver = Arc::new(IdentityResolver::new(cache));

        // 5. Build the classify+write path.
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&registry),
            Arc::clone(&customers),
            resolver,
        ));
        let writer = Arc::new(MetricWriter::new(
            pool.clone(),
            self.cfg.store.database.clone(),
            Some(Arc::clone(&self.health)),
        ));

        // 6. Build the presence path.
        let presence_store = Arc::new(PresenceStore::new(
            pool,
            self.cfg.store.database.clone(),
            Some(Arc::clone(&self.health)),
        ));
        let aggregator = Arc::new(PresenceAggregator::new(
            Arc::clone(&customers),
            presence_store,
        ));

        // 7. Spawn the run loops.
        let frame_rx = self.frame_rx.take().context("start called more than once")?;
        let ping_rx = self.ping_rx.take().context("start called more than once")?;

        self.frame_task = Some(tokio::spawn(frame_loop(
            self.cancel.child_token(),
            frame_rx,
            self.ping_tx.clone(),
            classifier,
            writer,
            Arc::clone(&self.health),
            self.cfg.pipeline.max_inflight,
        )));

        self.presence_task = Some(tokio::spawn(presence_loop(
            self.cancel.child_token(),
            ping_rx,
            aggregator,
            Arc::clone(&self.health),
            self.cfg.presence.interval,
            self.cfg.presence.by_network,
        )));

        info!(
            presence_interval = ?self.cfg.presence.interval,
            by_network = self.cfg.presence.by_network,
            max_inflight = self.cfg.pipeline.max_inflight,
            "agent started"
        );

        Ok(())
    }

    /// Gracefully stop all components, flushing buffered presence pings.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.frame_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "frame loop join failed");
            }
        }

        if let Some(task) = self.presence_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "presence loop join failed");
            }
        }

        if let Some(mut store) = self.store.take() {
            store.stop().await?;
            self.health.store_connected.set(0.0);
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }
}

/// Frame-processing loop: classify+write with a bounded number of
/// in-flight tasks.
#[allow(clippy::too_many_arguments)]
async fn frame_loop(
    cancel: CancellationToken,
    mut frame_rx: mpsc::Receiver<String>,
    ping_tx: mpsc::UnboundedSender<PresencePing>,
    classifier: Arc<Classifier>,
    writer: Arc<MetricWriter>,
    health: Arc<HealthMetrics>,
    max_inflight: usize,
) {
    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Let in-flight writes finish; new frames are no longer taken.
                while inflight.join_next().await.is_some() {}
                return;
            }

            Some(text) = frame_rx.recv() => {
                health.frames_received.inc();

                // Backpressure: wait for a slot before taking on more work.
                while inflight.len() >= max_inflight {
                    if inflight.join_next().await.is_none() {
                        break;
                    }
                }

                let classifier = Arc::clone(&classifier);
                let writer = Arc::clone(&writer);
                let health = Arc::clone(&health);
                let ping_tx = ping_tx.clone();

                inflight.spawn(async move {
                    process_frame(&text, &classifier, &writer, &health, &ping_tx).await;
                });
            }
        }
    }
}

/// Processes one raw frame end to end.
async fn process_frame(
    text: &str,
    classifier: &Classifier,
    writer: &MetricWriter,
    health: &HealthMetrics,
    ping_tx: &mpsc::UnboundedSender<PresencePing>,
) {
    let started = Instant::now();

    let packet = match parse_frame(text) {
        Ok(packet) => packet,
        Err(e) => {
            // Unattributable, dropped without a warning.
            health
                .frames_dropped
                .with_label_values(&["malformed_frame"])
                .inc();
            debug!(error = %e, "dropped malformed frame");
            return;
        }
    };

    // Every attributable frame also counts as a presence ping. Derivation
    // uses the split only, no region resolution.
    let (prefix, local_number) = identity::split(packet.sender());
    let ping = PresencePing {
        tenant_prefix: prefix,
        username: local_number,
        created_at_ms: packet.timestamp_ms(),
        network: packet.network(),
    };
    if ping_tx.send(ping).is_ok() {
        health.presence_pings.inc();
    }

    match classifier.classify(&packet).await {
        Ok(event) => {
            if let Err(e) = writer.write(&event).await {
                health.write_errors.inc();
                error!(error = %e, customer = event.customer_id, "metric write failed");
            } else {
                health.events_written.inc();
            }
        }
        Err(e) => {
            health
                .frames_dropped
                .with_label_values(&[e.reason()])
                .inc();
            if e.is_silent() {
                debug!(error = %e, "dropped frame");
            } else {
                warn!(error = %e, "dropped frame");
            }
        }
    }

    health
        .frame_processing_duration
        .observe(started.elapsed().as_secs_f64());
}

/// Presence loop: buffers pings and flushes one aggregation cycle per tick.
async fn presence_loop(
    cancel: CancellationToken,
    mut ping_rx: mpsc::UnboundedReceiver<PresencePing>,
    aggregator: Arc<PresenceAggregator>,
    health: Arc<HealthMetrics>,
    interval: std::time::Duration,
    by_network: bool,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut buffer: Vec<PresencePing> = Vec::new();

    const DRAIN_BATCH: usize = 256;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Final flush of whatever is buffered.
                while let Ok(ping) = ping_rx.try_recv() {
                    buffer.push(ping);
                }
                flush_cycle(&aggregator, &health, &mut buffer, by_network).await;
                return;
            }

            Some(ping) = ping_rx.recv() => {
                buffer.push(ping);

                // Drain a bounded burst without blocking the ticker.
                for _ in 0..DRAIN_BATCH - 1 {
                    match ping_rx.try_recv() {
                        Ok(ping) => buffer.push(ping),
                        Err(_) => break,
                    }
                }
            }

            _ = ticker.tick() => {
                flush_cycle(&aggregator, &health, &mut buffer, by_network).await;
            }
        }
    }
}

/// Aggregates and flushes the buffered pings as one cycle.
///
/// A failed flush loses the whole cycle: no partial-commit bookkeeping is
/// kept, so the batch is logged and dropped (best-effort analytics).
async fn flush_cycle(
    aggregator: &PresenceAggregator,
    health: &HealthMetrics,
    buffer: &mut Vec<PresencePing>,
    by_network: bool,
) {
    if buffer.is_empty() {
        return;
    }

    let pings = std::mem::take(buffer);
    let started = Instant::now();

    match aggregator.aggregate_and_flush(&pings, by_network).await {
        Ok(()) => {
            health.presence_flushes.inc();
            health.presence_batch_size.observe(pings.len() as f64);
            debug!(pings = pings.len(), "presence cycle flushed");
        }
        Err(e) => {
            health.presence_flush_errors.inc();
            error!(error = %e, pings = pings.len(), "presence cycle lost");
        }
    }

    health
        .presence_flush_duration
        .observe(started.elapsed().as_secs_f64());
}
