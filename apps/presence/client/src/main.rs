use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use tripteller_presence_client::offline::DEFAULT_QUEUE_CAPACITY;
use tripteller_presence_client::{
    HealthMonitor, HttpSampleStore, MonitorConfig, OfflineSync, Phase, Tracker, TrackerConfig,
    WalkingSource, WsConnector,
};
use tripteller_presence_core::{ClientEvent, JoinObserver, ServerEvent};

#[derive(Debug, Parser)]
#[command(
    name = "tripteller-presence-client",
    version,
    about = "Simulated field worker and observer for the TripTeller presence server"
)]
struct Cli {
    #[command(flatten)]
    server: ServerArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// Presence WebSocket endpoint.
    #[arg(
        long,
        global = true,
        env = "TRIPTELLER_PRESENCE_URL",
        default_value = "ws://127.0.0.1:5000/ws"
    )]
    url: String,

    /// Identity token presented when the socket opens.
    #[arg(long, global = true, env = "TRIPTELLER_PRESENCE_TOKEN")]
    token: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk a straight line and report it like a field worker would.
    Simulate(SimulateArgs),
    /// Join as an observer and log what the fleet is doing.
    Observe {
        #[arg(long)]
        display_name: Option<String>,
    },
}

#[derive(Debug, Args)]
struct SimulateArgs {
    #[arg(long)]
    subject_id: Option<String>,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long, default_value_t = 13.0827, allow_hyphen_values = true)]
    latitude: f64,
    #[arg(long, default_value_t = 80.2707, allow_hyphen_values = true)]
    longitude: f64,
    /// Bearing in degrees clockwise from north.
    #[arg(long, default_value_t = 45.0)]
    bearing: f64,
    #[arg(long, default_value_t = 1.4)]
    speed_mps: f64,
    #[arg(long, default_value_t = 3_000)]
    period_ms: u64,
    /// Stop after this many fixes; runs until Ctrl-C otherwise.
    #[arg(long)]
    steps: Option<u64>,
    /// Base URL of the location history API. Samples are only broadcast when unset.
    #[arg(long, env = "TRIPTELLER_HISTORY_URL")]
    history_url: Option<String>,
    /// Bearer token for the history API; defaults to the presence token.
    #[arg(long, env = "TRIPTELLER_HISTORY_TOKEN")]
    history_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut connector = WsConnector::new(&cli.server.url);
    if let Some(token) = &cli.server.token {
        connector = connector.with_token(token);
    }
    let monitor = HealthMonitor::new(connector, MonitorConfig::default());

    match cli.command {
        Command::Simulate(args) => simulate(monitor, args, cli.server.token).await,
        Command::Observe { display_name } => observe(monitor, display_name).await,
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
}

async fn simulate(monitor: HealthMonitor, args: SimulateArgs, token: Option<String>) -> Result<()> {
    let config = TrackerConfig {
        subject_id: args.subject_id,
        display_name: args.display_name,
        ..TrackerConfig::default()
    };
    let mut tracker = Tracker::new(monitor.clone(), config);

    if let Some(history_url) = args.history_url {
        let bearer = args
            .history_token
            .or(token)
            .context("--history-url needs --history-token or --token")?;
        let store = HttpSampleStore::new(history_url, bearer).context("building history client")?;
        let sync = Arc::new(OfflineSync::new(Arc::new(store), DEFAULT_QUEUE_CAPACITY));
        follow_link(&monitor, sync.clone());
        tracker = tracker.with_sync(sync);
    }

    let mut source = WalkingSource::new(
        args.latitude,
        args.longitude,
        args.speed_mps,
        Duration::from_millis(args.period_ms),
    )
    .bearing(args.bearing);
    if let Some(steps) = args.steps {
        source = source.steps(steps);
    }

    tokio::spawn(log_events(monitor.clone()));
    tracker
        .start(source)
        .await
        .context("starting location tracking")?;

    let finished = tokio::select! {
        report = tracker.join() => Some(report),
        _ = signal::ctrl_c() => None,
    };
    let report = match finished {
        Some(report) => report?,
        None => {
            info!("interrupted; stopping tracking");
            tracker.stop().await?
        }
    };
    info!(
        subject_id = %tracker.subject_id(),
        accepted = report.sampler.accepted,
        filtered = report.sampler.filtered,
        broadcast = report.broadcast,
        skipped = report.broadcast_skipped,
        saved = report.saved,
        queued = report.queued,
        "simulation finished"
    );
    monitor.disconnect();
    Ok(())
}

/// The presence link doubles as the reachability signal for history saves.
fn follow_link(monitor: &HealthMonitor, sync: Arc<OfflineSync>) {
    let mut phases = monitor.phase_changes();
    tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            if phase == Phase::Connecting {
                continue;
            }
            if let Err(err) = sync.set_online(phase == Phase::Connected).await {
                warn!(error = %err, "history sync needs attention");
            }
        }
    });
}

async fn log_events(monitor: HealthMonitor) {
    let mut events = monitor.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn observe(monitor: HealthMonitor, display_name: Option<String>) -> Result<()> {
    let join = ClientEvent::JoinObserver(JoinObserver { display_name });
    let mut events = monitor.subscribe();
    let mut phases = monitor.phase_changes();
    let mut check = tokio::time::interval(Duration::from_secs(5));

    monitor
        .connect()
        .await
        .context("connecting to presence server")?;
    phases.borrow_and_update();
    monitor.safe_send(&join);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                debug!(?phase, "presence link phase changed");
                if phase == Phase::Connected {
                    // observer membership does not survive the old socket
                    monitor.safe_send(&join);
                }
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "observer fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = check.tick() => {
                if monitor.needs_intervention() {
                    monitor.disconnect();
                    bail!(
                        "presence server unreachable after {} attempts",
                        monitor.attempt_count()
                    );
                }
            }
        }
    }

    monitor.disconnect();
    Ok(())
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::SubjectSnapshot(subjects) => {
            info!(count = subjects.len(), "active subjects");
            for subject in subjects {
                info!(
                    subject_id = %subject.subject_id,
                    name = subject.display_name.as_deref().unwrap_or("-"),
                    latitude = subject.latitude,
                    longitude = subject.longitude,
                    "subject"
                );
            }
        }
        ServerEvent::SubjectUpdate(update) => info!(
            subject_id = %update.subject_id,
            latitude = update.latitude,
            longitude = update.longitude,
            "subject moved"
        ),
        ServerEvent::SubjectDeparted(departed) => info!(
            subject_id = %departed.subject_id,
            reason = departed.reason.as_str(),
            "subject departed"
        ),
        ServerEvent::ObserverJoined(joined) => info!(
            active_subjects = joined.active_subject_count,
            already_joined = joined.already_joined,
            "joined as observer"
        ),
        ServerEvent::ObserverJoinRejected(rejection) | ServerEvent::LocationRejected(rejection) => {
            warn!(event = event.name(), reason = %rejection.reason, "request rejected")
        }
        other => debug!(event = other.name(), "server event"),
    }
}
