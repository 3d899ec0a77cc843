//! Control plane -- engine assembly, sampling and shutdown.
//!
//! The [`Orchestrator`] owns the [`FilterEngine`]. It publishes the configured
//! rule, attaches the classifier, samples the counter table on a fixed
//! interval and tears everything down on SIGINT or SIGTERM.
//!
//! # Shutdown order
//!
//! 1. Stop the sampler (no periodic sample after this point)
//! 2. Take and render exactly one final sample
//! 3. Detach the classifier
//! 4. Remove the PID file

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use portwarden_core::config::{FilterMode, PortwardenConfig};
use portwarden_core::metrics as m;
use portwarden_filter::config::{attribution_from_config, initial_records};
use portwarden_filter::hook::{IngressHook, platform_hook};
use portwarden_filter::{CounterSnapshot, CounterTable, EngineConfig, FilterEngine};

use crate::metrics_server;
use crate::reporter::{ReportFormat, Reporter};

/// The daemon control plane.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: PortwardenConfig,
    /// The filter being driven.
    engine: FilterEngine,
    /// Shutdown broadcast sender (stops the sampler).
    shutdown_tx: broadcast::Sender<()>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator {
    /// Load configuration from `config_path` and build the orchestrator.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = PortwardenConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config)
    }

    /// Build with the platform's ingress hook.
    ///
    /// Installs the Prometheus recorder when `[metrics]` is enabled.
    pub fn build_from_config(config: PortwardenConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let hook = platform_hook(config.filter.hook, config.filter.queue_num)
            .map_err(|e| anyhow::anyhow!("failed to create ingress hook: {}", e))?;
        Self::build_with_hook(config, hook)
    }

    /// Build with an explicit ingress hook.
    ///
    /// Nothing is attached until [`run`](Self::run).
    pub fn build_with_hook(config: PortwardenConfig, hook: Box<dyn IngressHook>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        let engine_config = EngineConfig::from_core(&config)
            .map_err(|e| anyhow::anyhow!("invalid filter configuration: {}", e))?;
        let mode = engine_config.mode();

        let mut builder = FilterEngine::builder().config(engine_config).hook(hook);
        if mode == FilterMode::ProcessAware {
            let attribution = attribution_from_config(&config.attribution)
                .map_err(|e| anyhow::anyhow!("invalid attribution configuration: {}", e))?;
            builder = builder.attribution(attribution);
        }
        let engine = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build filter engine: {}", e))?;

        if mode == FilterMode::ProcessAware {
            let records = initial_records(&config.filter.process)
                .map_err(|e| anyhow::anyhow!("invalid process registry: {}", e))?;
            let count = records.len();
            engine.register_processes(records)?;
            tracing::info!(processes = count, "process registry populated");
        }

        tracing::info!(
            interface = config.filter.interface.as_str(),
            mode = %mode,
            attribution = engine.attribution_name().unwrap_or("none"),
            hook = engine.hook_kind(),
            "orchestrator initialized"
        );
        if !engine.enforces_verdicts() {
            tracing::warn!(
                hook = engine.hook_kind(),
                "hook only observes traffic, dropped packets are counted but still delivered"
            );
        }

        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Self {
            config,
            engine,
            shutdown_tx,
            start_time: Instant::now(),
        })
    }

    /// Attach, sample until SIGINT/SIGTERM, then shut down.
    pub async fn run(&mut self) -> Result<CounterSnapshot> {
        self.run_until(wait_for_shutdown_signal()).await
    }

    /// Attach, sample until `shutdown` resolves, then shut down.
    ///
    /// `shutdown` yields the name of the trigger for logging. Returns the
    /// final sample.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<CounterSnapshot>
    where
        F: Future<Output = Result<&'static str>>,
    {
        let pid_file = self.pid_file();
        if let Some(path) = &pid_file {
            write_pid_file(path)?;
        }

        if let Err(e) = self.engine.start() {
            if let Some(path) = &pid_file {
                remove_pid_file(path);
            }
            return Err(anyhow::anyhow!(
                "failed to attach filter to {}: {}",
                self.config.filter.interface,
                e
            ));
        }

        let format = ReportFormat::from_log_format(&self.config.general.log_format);
        let reporter = Reporter::new(self.engine.config(), format)
            .with_enforcement(self.engine.enforces_verdicts());
        for line in reporter.banner() {
            println!("{line}");
        }
        if self.config.metrics.enabled {
            self.record_attach_metrics(1.0);
        }

        let sampler = spawn_sampler(
            Arc::clone(self.engine.counters()),
            reporter,
            Duration::from_secs(self.config.filter.sample_interval_secs),
            SamplerMetrics::new(&self.config, self.engine.mode(), self.start_time),
            self.shutdown_tx.subscribe(),
        );

        let signal = match shutdown.await {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!(error = %e, "shutdown trigger failed, shutting down");
                "error"
            }
        };
        tracing::info!(signal, "shutdown signal received");

        Ok(self.shutdown(sampler, pid_file.as_deref(), format).await)
    }

    async fn shutdown(
        &mut self,
        sampler: JoinHandle<Reporter>,
        pid_file: Option<&Path>,
        format: ReportFormat,
    ) -> CounterSnapshot {
        let _ = self.shutdown_tx.send(());
        let mut reporter = match sampler.await {
            Ok(reporter) => reporter,
            Err(e) => {
                tracing::warn!(error = %e, "sampler task failed");
                Reporter::new(self.engine.config(), format)
                    .with_enforcement(self.engine.enforces_verdicts())
            }
        };

        let last = self.engine.sample();
        println!("{}", reporter.render_final(&last));
        if self.config.metrics.enabled {
            last.publish_metrics(self.engine.mode());
        }

        if let Err(e) = self.engine.stop() {
            tracing::error!(error = %e, "failed to detach filter");
        }
        if self.config.metrics.enabled {
            self.record_attach_metrics(0.0);
        }

        if let Some(path) = pid_file {
            remove_pid_file(path);
        }

        tracing::info!(
            total = last.total(),
            uptime_secs = self.start_time.elapsed().as_secs(),
            "portwarden stopped"
        );
        last
    }

    fn record_attach_metrics(&self, attached: f64) {
        let interface = self.config.filter.interface.clone();
        metrics::gauge!(m::FILTER_ATTACHED, m::LABEL_INTERFACE => interface).set(attached);
        metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(m::FILTER_RULE_GENERATION).set(self.engine.rule_generation() as f64);
        if let Ok(registry) = self.engine.registry() {
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(m::FILTER_REGISTERED_PROCESSES).set(registry.len() as f64);
        }
    }

    fn pid_file(&self) -> Option<std::path::PathBuf> {
        let path = &self.config.general.pid_file;
        (!path.is_empty()).then(|| path.into())
    }

    /// The filter engine.
    pub fn engine(&self) -> &FilterEngine {
        &self.engine
    }

    /// The loaded configuration.
    pub fn config(&self) -> &PortwardenConfig {
        &self.config
    }
}

/// What the sampler publishes besides the console line.
#[derive(Debug, Clone, Copy)]
struct SamplerMetrics {
    enabled: bool,
    mode: FilterMode,
    start_time: Instant,
}

impl SamplerMetrics {
    fn new(config: &PortwardenConfig, mode: FilterMode, start_time: Instant) -> Self {
        Self {
            enabled: config.metrics.enabled,
            mode,
            start_time,
        }
    }

    fn publish(&self, snapshot: &CounterSnapshot) {
        if !self.enabled {
            return;
        }
        snapshot.publish_metrics(self.mode);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(self.start_time.elapsed().as_secs() as f64);
    }
}

/// Spawn the periodic sampler.
///
/// The first sample is taken one `period` after start. Returns the reporter
/// on shutdown so the final sample continues its deltas.
fn spawn_sampler(
    counters: Arc<CounterTable>,
    mut reporter: Reporter,
    period: Duration,
    metrics: SamplerMetrics,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<Reporter> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::debug!("sampler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let snapshot = counters.snapshot();
                    println!("{}", reporter.render(&snapshot));
                    metrics.publish(&snapshot);
                }
            }
        }
        reporter
    })
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
pub async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Write the current process PID to a file.
///
/// The file is created atomically with `create_new` and mode 0o600; an
/// existing file means another instance is running.
pub fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .mode(0o700)
            .recursive(true)
            .create(parent)?;
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    if !file.metadata()?.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file",
            path.display()
        ));
    }

    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file. Failure is logged, not returned.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}
