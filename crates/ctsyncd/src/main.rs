//! Connection Tracking Synchronization Daemon
//!
//! Main entry point for the ctsyncd daemon.
//! Captures kernel conntrack events for TCP and UDP and hands the filtered
//! records to the NAT/offload pipeline.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - SC-7: Boundary Protection - Startup interface exclusions
//! - SI-4: System Monitoring - Real-time event processing

use anyhow::{Context, bail};
use clap::Parser;
use sonic_ctsyncd::config::{DEFAULT_CONFIG_PATH, FilterConfig};
use sonic_ctsyncd::{
    AddressResolver, CapturePolicy, CaptureSession, CaptureStats, ChannelGateway,
    ConntrackBackend, CtsyncConfig, CtsyncError, DispatchEvent, DispatchGateway,
    DispatchMessage, FilterBuilder, FilterCoordinator, L4Protocol, NatTimeoutStore, NatTimeouts,
    NetlinkConntrack, SystemResolver, TimeoutWatcher, run_udp_timestamp_refresh,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// SONiC connection tracking synchronization daemon
#[derive(Parser, Debug)]
#[command(name = "ctsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Forward IPv6 and TCP creation events, disable the WAN gate
    #[arg(long)]
    extended: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // NIST: AU-3, AU-12 - Audit logging setup
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("ctsyncd: {}", e);
        return ExitCode::FAILURE;
    }

    info!("ctsyncd: Starting connection tracking synchronization daemon");

    match run_daemon(args).await {
        Ok(()) => {
            info!("ctsyncd: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "ctsyncd: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over the command line level.
fn init_logging(log_level: &str) -> sonic_ctsyncd::Result<()> {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CtsyncError::Configuration(format!("Failed to set logger: {}", e)))
}

/// Main daemon body
///
/// # NIST Controls
/// - SI-4: System Monitoring - Capture sessions per protocol
/// - CM-6: Configuration Settings - Timeout watcher
async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let mut config = CtsyncConfig::load_or_default(&args.config)?;
    if args.extended {
        config.capture.extended_mode = true;
    }
    config.validate()?;

    let policy = CapturePolicy::from_extended(config.capture.extended_mode);
    info!(
        extended = config.capture.extended_mode,
        bridge = %config.filter.bridge_interface,
        "ctsyncd: Configuration loaded"
    );

    let resolver: Arc<dyn AddressResolver> = Arc::new(SystemResolver);
    let builder = FilterBuilder::new(Arc::clone(&resolver), config.filter.bridge_interface.clone());
    let coordinator =
        FilterCoordinator::new(builder).context("Failed to configure baseline filters")?;
    apply_startup_interfaces(&coordinator, resolver.as_ref(), &config.filter);

    let cancel = CancellationToken::new();

    let (gateway, rx) = ChannelGateway::bounded(config.dispatch.queue_depth);
    let consumer = tokio::spawn(consume_dispatch(rx));
    let gateway: Arc<dyn DispatchGateway> = Arc::new(gateway);

    // NIST: AC-3 - ctnetlink subscriptions require CAP_NET_ADMIN
    let backend: Arc<dyn ConntrackBackend> = Arc::new(NetlinkConntrack::new(
        config.recv_timeout(),
        config.capture.recv_buffer_bytes,
    ));

    let mut sessions = Vec::new();
    for protocol in [L4Protocol::Tcp, L4Protocol::Udp] {
        let session = CaptureSession::new(
            Arc::clone(&backend),
            coordinator.filter(protocol),
            policy,
            coordinator.wan_state(),
        );
        let handle = session
            .spawn(Arc::clone(&gateway), cancel.clone())
            .with_context(|| format!("Failed to spawn {} capture thread", protocol))?;
        sessions.push((protocol, handle));
    }
    // The consumer ends once the sessions release their gateway clones
    drop(gateway);

    let nat = Arc::new(NatTimeouts::new());
    let store: Arc<dyn NatTimeoutStore> = nat.clone();

    let watcher = TimeoutWatcher::new(
        &config.timeouts.directory,
        config.timeouts.tcp_file.clone(),
        config.timeouts.udp_file.clone(),
        Arc::clone(&store),
    )
    .with_poll_interval(config.poll_interval());
    let watcher_handle = watcher
        .spawn(cancel.clone())
        .context("Failed to spawn timeout watcher thread")?;

    let refresh = tokio::spawn(run_udp_timestamp_refresh(
        store,
        config.udp_refresh_interval(),
        cancel.clone(),
    ));

    info!("ctsyncd: Listening to conntrack events...");
    wait_for_shutdown(&cancel).await;
    cancel.cancel();

    let joined = tokio::task::spawn_blocking(move || {
        let mut failed = 0usize;
        for (protocol, handle) in sessions {
            if !report_session(protocol, handle) {
                failed += 1;
            }
        }
        match watcher_handle.join() {
            Ok(Ok(())) => debug!("ctsyncd: Timeout watcher stopped"),
            Ok(Err(e)) => {
                error!(error = %e, "ctsyncd: Timeout watcher failed");
                failed += 1;
            }
            Err(_) => {
                error!("ctsyncd: Timeout watcher panicked");
                failed += 1;
            }
        }
        failed
    });
    let failed = joined.await.context("Failed to join worker threads")?;

    let refreshes = refresh.await.context("UDP refresh task failed")?;
    let dispatched = consumer.await.context("Dispatch consumer failed")?;
    info!(
        refreshes,
        dispatched,
        tcp_timeout = ?nat.timeout(L4Protocol::Tcp),
        udp_timeout = ?nat.timeout(L4Protocol::Udp),
        "ctsyncd: Graceful shutdown complete"
    );
    if failed > 0 {
        bail!("{} worker thread(s) stopped with an error", failed);
    }
    Ok(())
}

/// Exclude configured LAN interfaces and mark the WAN link
///
/// # NIST Controls
/// - SC-7: Boundary Protection - Local subnets never offloaded
fn apply_startup_interfaces(
    coordinator: &FilterCoordinator,
    resolver: &dyn AddressResolver,
    filter: &FilterConfig,
) {
    for ifname in &filter.lan_interfaces {
        let result = resolver
            .resolve(ifname)
            .and_then(|info| coordinator.on_interface_up(&info, false));
        if let Err(e) = result {
            warn!(interface = %ifname, error = %e, "ctsyncd: LAN interface exclusion failed");
        }
    }

    if let Some(wan) = &filter.wan_interface {
        match resolver.resolve(wan) {
            Ok(info) => {
                if let Err(e) = coordinator.on_interface_up(&info, true) {
                    warn!(interface = %wan, error = %e, "ctsyncd: WAN interface update failed");
                }
            }
            Err(e) => warn!(interface = %wan, error = %e, "ctsyncd: WAN interface not resolved"),
        }
        coordinator.on_wan_state_change(true);
    }
}

/// Drain the dispatch queue until every producer is gone
async fn consume_dispatch(mut rx: mpsc::Receiver<DispatchMessage>) -> u64 {
    let mut count = 0u64;
    while let Some(message) = rx.recv().await {
        count += 1;
        let family = match message.event {
            DispatchEvent::Conntrack => "ipv4",
            DispatchEvent::ConntrackV6 => "ipv6",
        };
        debug!(
            family,
            kind = ?message.kind,
            protocol = %message.record.protocol,
            flow = %message.record.original,
            "ctsyncd: Conntrack event"
        );
    }
    count
}

/// Join a capture thread, returning whether it stopped cleanly
fn report_session(
    protocol: L4Protocol,
    handle: JoinHandle<sonic_ctsyncd::Result<CaptureStats>>,
) -> bool {
    match handle.join() {
        Ok(Ok(stats)) => {
            info!(
                %protocol,
                received = stats.received,
                forwarded = stats.forwarded,
                "ctsyncd: Capture session stopped"
            );
            true
        }
        Ok(Err(e)) => {
            error!(%protocol, error = %e, "ctsyncd: Capture session failed");
            false
        }
        Err(_) => {
            error!(%protocol, "ctsyncd: Capture thread panicked");
            false
        }
    }
}

/// Wait for SIGINT or SIGTERM, or for a worker to stop the daemon
///
/// # NIST Controls
/// - AU-12: Audit Record Generation - Log shutdown signals
async fn wait_for_shutdown(cancel: &CancellationToken) {
    tokio::select! {
        _ = shutdown_signal() => info!("ctsyncd: Received SIGINT/SIGTERM"),
        _ = cancel.cancelled() => warn!("ctsyncd: Worker stopped, shutting down"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "ctsyncd: SIGTERM handler unavailable");
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
