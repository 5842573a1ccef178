use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use msg_mirror::common::diagnostics::DiagnosticLog;
use msg_mirror::common::error::EndpointError;
use msg_mirror::common::paths::{state_dir, StatePaths};
use msg_mirror::common::store::{DurableStore, Field};
use msg_mirror::common::types::{CapturedEvent, Permission};
use msg_mirror::daemon::control::Control;
use msg_mirror::daemon::server::DaemonServer;
use msg_mirror::ipc::client::{DaemonClient, RemoteControl};
use msg_mirror::relay::Endpoint;

#[derive(Parser, Debug)]
#[command(name = "msg-mirror")]
#[command(about = "Capture SMS and notification events and relay them to a live consumer")]
struct Args {
    /// State directory (default: $MSG_MIRROR_HOME or the platform data dir)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Verbose process logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the headless context in the foreground
    Daemon {
        /// Permission granted to the capture host
        #[arg(long = "grant", value_enum)]
        grants: Vec<Grant>,
    },
    /// Start the headless context in the background
    Start {
        #[arg(long = "grant", value_enum)]
        grants: Vec<Grant>,
    },
    /// Stop the headless context
    Stop,
    /// Show the running flag and daemon status
    Status,
    /// Ask every endpoint to retry queued deliveries
    ForceRetry,
    /// Hand a captured event to the daemon
    Capture {
        #[arg(value_enum)]
        source: SourceArg,
        /// Sender address, or notification title
        #[arg(long)]
        from: String,
        #[arg(long)]
        body: String,
        /// Originating package (notifications only)
        #[arg(long)]
        package: Option<String>,
        /// Epoch milliseconds (default: now)
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Turn SMS capture on or off
    Sms {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Print delivered events and signals as they arrive
    Watch {
        /// Drain the retry queue once subscribed
        #[arg(long)]
        retry: bool,
    },
    /// Show the diagnostic log
    Logs {
        /// Empty the log instead
        #[arg(long)]
        clear: bool,
    },
    /// Read or write configuration fields
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Restart trigger: start the headless context in the foreground
    Boot {
        #[arg(long = "grant", value_enum)]
        grants: Vec<Grant>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print one field, or all of them
    Get { field: Option<String> },
    /// Write one field
    Set { field: String, value: String },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Grant {
    Sms,
    Notifications,
}

impl From<Grant> for Permission {
    fn from(grant: Grant) -> Self {
        match grant {
            Grant::Sms => Permission::ReadSms,
            Grant::Notifications => Permission::NotificationAccess,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SourceArg {
    Sms,
    Notification,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Switch {
    On,
    Off,
}

fn permissions(grants: &[Grant]) -> Vec<Permission> {
    grants.iter().map(|g| Permission::from(*g)).collect()
}

fn init_tracing(debug: bool, daemon: bool) {
    let default = if debug {
        "debug"
    } else if daemon {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// Run the daemon until Ctrl-C or a `Shutdown` command
fn run_daemon(paths: StatePaths, grants: &[Grant], after_boot: bool) -> Result<()> {
    let server = DaemonServer::new(paths, permissions(grants));
    let trigger = server.shutdown_trigger();
    ctrlc::set_handler(trigger).context("Error setting Ctrl-C handler")?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    if after_boot {
        runtime.block_on(server.run_after_boot())
    } else {
        runtime.block_on(server.run())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn build_event(
    source: SourceArg,
    from: String,
    body: String,
    package: Option<String>,
    timestamp: i64,
) -> Result<CapturedEvent> {
    match source {
        SourceArg::Sms => {
            if package.is_some() {
                bail!("--package only applies to notifications");
            }
            Ok(CapturedEvent::sms(from, body, timestamp))
        }
        SourceArg::Notification => {
            let package = package.context("--package is required for notifications")?;
            Ok(CapturedEvent::notification(package, from, body, timestamp))
        }
    }
}

fn parse_field(key: &str) -> Result<Field> {
    Field::from_key(key).with_context(|| {
        let known: Vec<&str> = Field::ALL.iter().map(|f| f.key()).collect();
        format!("Unknown field '{}' (known: {})", key, known.join(", "))
    })
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" => Ok(false),
        _ => bail!("Expected a boolean, got '{}'", value),
    }
}

fn config_get(store: &DurableStore, field: Field) -> String {
    match field {
        Field::Reception => store.reception_filter(),
        Field::Endpoint => store.endpoint_url(),
        Field::SmsEnabled => store.sms_capture_enabled().to_string(),
        Field::AllowedPackages => store
            .allowed_packages()
            .into_iter()
            .collect::<Vec<_>>()
            .join(","),
        Field::PayloadTemplate => store.payload_template(),
        Field::RetryQueue => store.retry_queue(),
        Field::ServiceRunning => store.is_running().to_string(),
    }
}

fn config_set(store: &DurableStore, field: Field, value: &str) -> Result<()> {
    let result = match field {
        Field::SmsEnabled | Field::ServiceRunning => store.try_set(field, &parse_bool(value)?),
        Field::AllowedPackages => {
            let packages: BTreeSet<String> = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
            store.try_set(field, &packages)
        }
        Field::Reception | Field::Endpoint | Field::PayloadTemplate | Field::RetryQueue => {
            store.try_set(field, value)
        }
    };
    result.with_context(|| format!("Failed to write {}", field))
}

fn print_status(control: &RemoteControl, client: &mut DaemonClient) {
    let running = if control.is_running() {
        "yes".green()
    } else {
        "no".red()
    };
    println!("running:   {}", running);

    match client.status() {
        Some(status) => {
            let on_off = |on: bool| if on { "on".green() } else { "off".dimmed() };
            println!("daemon:    {} (up {}s)", status.state.green(), status.uptime_secs);
            println!("sms:       {}", on_off(status.sms_observer));
            println!("notify:    {}", on_off(status.notification_observer));
            println!("pending:   {}", status.pending_events);
            println!("watchers:  {}", status.subscriber_count);
        }
        None => println!("daemon:    {}", "not reachable".yellow()),
    }
}

fn print_event(event: &CapturedEvent) {
    let when = chrono::DateTime::from_timestamp_millis(event.timestamp)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| event.timestamp.to_string());
    let origin = match &event.origin_package {
        Some(package) => format!(" [{}]", package).dimmed().to_string(),
        None => String::new(),
    };
    println!(
        "{} {:<12} {}{}: {}",
        when.dimmed(),
        event.source.to_string().cyan(),
        event.from.bold(),
        origin,
        event.body
    );
}

/// Interactive endpoint printing to the terminal
struct ConsoleEndpoint;

impl Endpoint for ConsoleEndpoint {
    fn deliver(&self, event: &CapturedEvent) -> Result<(), EndpointError> {
        print_event(event);
        Ok(())
    }

    fn signal(&self, name: &str) -> Result<(), EndpointError> {
        println!("{} {}", "signal".magenta(), name);
        Ok(())
    }
}

fn watch(paths: &StatePaths, retry: bool) -> Result<()> {
    let subscription = DaemonClient::new(paths.socket())
        .subscribe()
        .context("Daemon not reachable; run `msg-mirror start` first")?;
    eprintln!("{}", "Watching for events (Ctrl-C to stop)".dimmed());

    let control = RemoteControl::new(paths.clone(), Vec::new());
    let console: Arc<dyn Endpoint> = Arc::new(ConsoleEndpoint);
    control.attach(&console);
    if retry {
        control.force_flush_retry();
    }

    let delivered = control.pump(subscription);
    control.detach(&console);
    eprintln!(
        "{}",
        format!("Daemon closed the stream after {} events", delivered).dimmed()
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let daemon_mode = matches!(args.command, Commands::Daemon { .. } | Commands::Boot { .. });
    init_tracing(args.debug, daemon_mode);

    let paths = StatePaths::new(state_dir(args.home.as_deref()));
    tracing::debug!(home = %paths.root().display(), "state directory");

    match args.command {
        Commands::Daemon { grants } => run_daemon(paths, &grants, false),

        Commands::Boot { grants } => run_daemon(paths, &grants, true),

        Commands::Start { grants } => {
            let control = RemoteControl::new(paths.clone(), permissions(&grants));
            control.start();
            if let Some(notice) = control.take_notice() {
                eprintln!("{}", notice.red());
                std::process::exit(1);
            }
            println!("{}", "Monitoring service running".green());
            Ok(())
        }

        Commands::Stop => {
            let control = RemoteControl::new(paths, Vec::new());
            control.stop();
            println!("Monitoring service stopped");
            Ok(())
        }

        Commands::Status => {
            let control = RemoteControl::new(paths.clone(), Vec::new());
            let mut client = DaemonClient::new(paths.socket());
            print_status(&control, &mut client);
            Ok(())
        }

        Commands::ForceRetry => {
            RemoteControl::new(paths, Vec::new()).force_flush_retry();
            Ok(())
        }

        Commands::Capture {
            source,
            from,
            body,
            package,
            timestamp,
        } => {
            let event = build_event(source, from, body, package, timestamp.unwrap_or_else(now_millis))?;
            DaemonClient::new(paths.socket())
                .capture(event)
                .context("Capture was not accepted")
        }

        Commands::Sms { state } => {
            let enabled = state == Switch::On;
            DurableStore::open(paths.prefs_dir()).set_sms_capture_enabled(enabled);
            match DaemonClient::new(paths.socket()).set_sms_enabled(enabled) {
                Some(active) => println!(
                    "SMS capture {} (subscription {})",
                    if enabled { "on" } else { "off" },
                    if active { "active".green() } else { "inactive".yellow() }
                ),
                None => println!(
                    "SMS capture {}; applies when the service starts",
                    if enabled { "on" } else { "off" }
                ),
            }
            Ok(())
        }

        Commands::Watch { retry } => watch(&paths, retry),

        Commands::Logs { clear } => {
            let log = DiagnosticLog::open(paths.log_file());
            if clear {
                log.clear();
                println!("Logs cleared");
                return Ok(());
            }
            // The daemon reads off its hot path; fall back to the file directly
            let entries = DaemonClient::new(paths.socket())
                .read_logs()
                .unwrap_or_else(|| log.read());
            if entries.is_empty() {
                println!("{}", "(no log entries)".dimmed());
            }
            for entry in entries {
                println!(
                    "{} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    entry.message
                );
            }
            Ok(())
        }

        Commands::Config { action } => {
            let store = DurableStore::open(paths.prefs_dir());
            match action {
                ConfigAction::Get { field: Some(key) } => {
                    println!("{}", config_get(&store, parse_field(&key)?));
                }
                ConfigAction::Get { field: None } => {
                    for field in Field::ALL {
                        println!("{} = {}", field.key().bold(), config_get(&store, field));
                    }
                }
                ConfigAction::Set { field, value } => {
                    config_set(&store, parse_field(&field)?, &value)?;
                }
            }
            Ok(())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
