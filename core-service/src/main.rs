//! RTM Ransomware Shield - Agent Entry Point
//!
//! `rtm-agent [run] [--feed <PATH>]` starts the agent in the foreground.
//! The remaining subcommands are operator tools that work against the same
//! data dir while the agent is running or stopped.

mod logic;
pub mod constants;

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};

use logic::config::{spawn_reload_watcher, ConfigHandle};
use logic::detection::AlertSequence;
use logic::events::{spawn_log_sink, NotificationBus};
use logic::pipeline::{spawn_republisher, Pipeline, PipelineParts};
use logic::playbook::{Ledger, PlaybookEngine};
use logic::response::{network, ActionExecutor, HostPlatform, QuarantineManager};
use logic::sensors::{feed, SensorSet};
use logic::status::{self, StatusInputs};
use logic::store::Store;
use logic::telemetry::{recorder, Normalizer};
use logic::transport::{build_publisher, AlertSink, DeliveryWorker, Outbox, SharedStatus, TransportStatus};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// How often status.json is rewritten
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// RTM Ransomware Shield host agent
#[derive(Parser, Debug)]
#[command(name = "rtm-agent")]
#[command(about = "Ransomware detection and automated response agent")]
#[command(version)]
#[command(after_help = "The config file is read from $RTM_AGENT_CONFIG or <data dir>/config.yaml.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Start the agent in the foreground (default)
    Run {
        /// Also read RawSensorEvent JSON lines from a file, or `-` for stdin
        #[arg(long, value_name = "PATH")]
        feed: Option<String>,
    },
    /// Validate the config file and playbooks
    CheckConfig,
    /// Print the last health snapshot
    Status,
    /// List quarantined files
    QuarantineList,
    /// Restore a quarantined file
    RestoreFile {
        /// Quarantine id, as shown by quarantine-list
        id: String,
    },
    /// Re-enable interfaces; the isolated set when none are named
    RestoreNetwork {
        ifaces: Vec<String>,
    },
    /// Print the audit trail of one alert
    Audit {
        alert_id: u64,
    },
}

fn main() {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Command::Run { feed: None }) {
        Command::Run { feed } => run(feed),
        Command::CheckConfig => check_config(),
        Command::Status => print_status(),
        Command::QuarantineList => quarantine_list(),
        Command::RestoreFile { id } => restore_file(&id),
        Command::RestoreNetwork { ifaces } => restore_network(ifaces),
        Command::Audit { alert_id } => audit(alert_id),
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// RUN
// ============================================================================

fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn run(feed: Option<String>) -> AppResult<()> {
    let started = Instant::now();
    log::info!("Starting {} v{}...", constants::APP_NAME, constants::APP_VERSION);

    // Invalid config or playbooks at startup is fatal
    let config_path = constants::get_config_path();
    let config = Arc::new(ConfigHandle::load(&config_path)?);
    let snapshot = config.current();
    let agent_id = snapshot.config.agent.id.clone();
    let data_dir = snapshot.config.storage.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    if let Err(e) = recorder::init(data_dir.join(constants::AUDIT_DIR), &host_name()) {
        log::warn!("[Audit] Recorder init failed: {} - audit records go to the log only", e);
    }

    let store = Arc::new(Store::open(&data_dir.join(constants::STORE_FILE))?);
    if let Err(e) = store.sweep_older_than(snapshot.config.storage.retention_days) {
        log::warn!("[Store] Retention sweep failed: {}", e);
    }

    let bus = NotificationBus::new(constants::NOTIFICATION_BUS_CAPACITY);
    spawn_log_sink(&bus)?;

    let quarantine_dir = snapshot.config.response.quarantine_dir();
    let quarantine = Arc::new(Mutex::new(QuarantineManager::new(quarantine_dir.clone())?));
    let executor = Arc::new(ActionExecutor::new(Arc::new(HostPlatform), quarantine, bus.clone()));
    let soar = Arc::new(PlaybookEngine::new(Ledger::new(store.clone()), executor));

    let outbox = Outbox::new(store.clone());
    let wake = Arc::new(Notify::new());
    let sink = AlertSink::new(outbox.clone(), &agent_id, wake.clone());
    let ids = Arc::new(AlertSequence::new(store.clone()));

    // Transport
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (transport_status, transport_thread): (SharedStatus, _) = match build_publisher(&snapshot) {
        Ok(publisher) => {
            let worker = DeliveryWorker::new(outbox.clone(), publisher, config.clone(), wake);
            let status = worker.status();
            let thread = std::thread::Builder::new()
                .name("transport".into())
                .spawn(move || {
                    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                        Ok(runtime) => runtime.block_on(worker.run(shutdown_rx)),
                        Err(e) => log::error!("[Transport] Runtime failed to start: {}", e),
                    }
                })?;
            (status, Some(thread))
        }
        Err(e) => {
            log::error!("[Transport] Publisher unavailable, alerts stay queued: {}", e);
            let status = TransportStatus {
                last_error: Some(e.to_string()),
                ..Default::default()
            };
            (Arc::new(RwLock::new(status)), None)
        }
    };

    spawn_republisher(&bus, sink.clone(), ids.clone(), config.clone())?;

    let pipeline = Pipeline::start(PipelineParts {
        config: config.clone(),
        ids,
        soar,
        sink,
        normalizer: Normalizer::new(quarantine_dir),
    })?;
    let handle = pipeline.sensor_handle();

    let sensors = SensorSet::start(&handle, &config);
    if let Some(source) = feed {
        let stop = sensors.stop_signal();
        if source == "-" {
            feed::spawn(BufReader::new(std::io::stdin()), handle.clone(), stop, "stdin".into())?;
        } else {
            let file = std::fs::File::open(&source)?;
            feed::spawn(BufReader::new(file), handle.clone(), stop, source)?;
        }
    }

    let _reload = match spawn_reload_watcher(config.clone()) {
        Ok(w) => Some(w),
        Err(e) => {
            log::warn!("[Config] Hot reload disabled: {}", e);
            None
        }
    };

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    log::info!("Agent {} running, Ctrl+C to stop", agent_id);

    let write_status = |sensors_running: usize| {
        let transport = transport_status.read().clone();
        let counts = match outbox.counts() {
            Ok(c) => c,
            Err(e) => {
                log::warn!("[Store] Outbox counts unavailable: {}", e);
                Default::default()
            }
        };
        let current = config.current();
        let snapshot = status::collect(StatusInputs {
            agent_id: &agent_id,
            uptime_secs: started.elapsed().as_secs(),
            config_generation: config.generation(),
            playbooks: current.playbooks.len(),
            sensors_running,
            intake: handle.stats(),
            outbox: counts,
            transport: &transport,
        });
        if let Err(e) = status::write(&data_dir, &snapshot) {
            log::warn!("Status write failed: {}", e);
        }
        snapshot
    };

    let mut reported: Vec<String> = Vec::new();
    loop {
        match stop_rx.recv_timeout(STATUS_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let problems = write_status(sensors.running()).problems();
                for problem in problems.iter().filter(|p| !reported.contains(p)) {
                    log::warn!("{}", problem);
                }
                reported = problems;
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Shutdown: producers first, then drain detection, then transport
    log::info!("Shutting down...");
    sensors.stop();
    let report = pipeline.shutdown();
    log::info!(
        "[Detection] {} event(s) evaluated, {} alert(s), {} response(s) off the hot path",
        report.detection.events,
        report.detection.alerts,
        report.responses
    );
    let _ = shutdown_tx.send(true);
    if let Some(thread) = transport_thread {
        if thread.join().is_err() {
            log::error!("[Transport] Delivery thread panicked");
        }
    }
    write_status(0);
    recorder::shutdown(started.elapsed().as_secs());
    log::info!("Agent stopped");
    Ok(())
}

// ============================================================================
// OPERATOR COMMANDS
// ============================================================================

/// Data dir from the config when it loads, the default otherwise
fn data_dir() -> PathBuf {
    match ConfigHandle::load(&constants::get_config_path()) {
        Ok(config) => config.current().config.storage.data_dir(),
        Err(e) => {
            log::debug!("Config unavailable ({}), using default data dir", e);
            constants::default_data_dir()
        }
    }
}

fn quarantine_dir() -> PathBuf {
    match ConfigHandle::load(&constants::get_config_path()) {
        Ok(config) => config.current().config.response.quarantine_dir(),
        Err(_) => constants::default_quarantine_dir(),
    }
}

fn check_config() -> AppResult<()> {
    let path = constants::get_config_path();
    let config = ConfigHandle::load(&path)?;
    let snapshot = config.current();
    println!("{:?}: OK", path);
    println!("  agent: {} ({})", snapshot.config.agent.id, snapshot.config.agent.name);
    println!("  watch paths: {}", snapshot.config.detection.watch_paths.len());
    println!("  outbound: {:?}", snapshot.config.outbound.mode);
    for playbook in snapshot.playbooks.iter() {
        println!("  playbook {}: {} action(s)", playbook.name, playbook.actions.len());
    }
    Ok(())
}

fn print_status() -> AppResult<()> {
    let status = status::read(&data_dir())?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    for problem in status.problems() {
        eprintln!("problem: {}", problem);
    }
    Ok(())
}

fn quarantine_list() -> AppResult<()> {
    let manager = QuarantineManager::new(quarantine_dir())?;
    println!("{}", serde_json::to_string_pretty(&manager.list())?);
    Ok(())
}

fn restore_file(id: &str) -> AppResult<()> {
    let mut manager = QuarantineManager::new(quarantine_dir())?;
    let restored = manager.restore(id)?;
    println!("restored {}", restored.display());
    Ok(())
}

/// Without names, the interfaces listed in the last status snapshot; when
/// there is none, every non-loopback interface
fn restore_network(ifaces: Vec<String>) -> AppResult<()> {
    let names = if ifaces.is_empty() {
        status::read(&data_dir())
            .map(|s| s.isolated_interfaces)
            .unwrap_or_default()
    } else {
        ifaces
    };
    let restored = network::restore_network(&names)?;
    if restored.is_empty() {
        println!("nothing to restore");
    }
    for nic in restored {
        println!("re-enabled {}", nic);
    }
    Ok(())
}

fn audit(alert_id: u64) -> AppResult<()> {
    let dir = data_dir().join(constants::AUDIT_DIR);
    print_trail(&dir, alert_id)
}

fn print_trail(dir: &Path, alert_id: u64) -> AppResult<()> {
    let trail = recorder::trail_for(dir, alert_id)?;
    if trail.is_empty() {
        println!("no audit records for alert #{}", alert_id);
    }
    for record in trail {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
