use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.vigil.Watch1",
    default_service = "org.vigil.Watch1",
    default_path = "/org/vigil/Watch1"
)]
trait Watch {
    async fn start_capture(&self) -> zbus::Result<String>;
    async fn stop_capture(&self) -> zbus::Result<String>;
    async fn start_recording(&self) -> zbus::Result<String>;
    async fn stop_recording(&self) -> zbus::Result<String>;
    async fn snapshot(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn add_known_person(&self, name: &str, image_path: &str) -> zbus::Result<String>;
    async fn remove_known_person(&self, name: &str) -> zbus::Result<String>;
    async fn list_known_persons(&self) -> zbus::Result<String>;
    async fn recent_detections(&self, limit: u32) -> zbus::Result<String>;
    async fn alerts(&self) -> zbus::Result<String>;
    async fn acknowledge_alert(&self, id: i64) -> zbus::Result<String>;
    async fn statistics(&self) -> zbus::Result<String>;
    async fn recent_logs(&self, limit: u32) -> zbus::Result<String>;
    async fn daily_report(&self, date: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil presence and recording controller CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start camera capture
    Start,
    /// Stop camera capture
    Stop,
    /// Start or stop a manual recording
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Save the current annotated frame
    Snapshot,
    /// Show daemon status
    Status,
    /// Register a known person from a single-face image
    Add {
        name: String,
        image: PathBuf,
    },
    /// Remove a known person
    Remove { name: String },
    /// List known persons
    List,
    /// Show recent detection events
    Detections {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Show unacknowledged alerts
    Alerts,
    /// Acknowledge an alert
    Ack { id: i64 },
    /// Show detection statistics
    Stats,
    /// Per-person report for one day
    Report {
        /// YYYY-MM-DD, defaults to today
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Show the daemon's event log
    Logs {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// List V4L2 capture devices (does not need the daemon)
    Test,
}

#[derive(Subcommand)]
enum RecordAction {
    Start,
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test = cli.command {
        return list_devices();
    }

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    };
    let conn = conn.context("cannot connect to D-Bus")?;
    let proxy = WatchProxy::new(&conn)
        .await
        .context("vigild is not reachable on D-Bus")?;

    match cli.command {
        Commands::Start => outcome(proxy.start_capture().await?),
        Commands::Stop => outcome(proxy.stop_capture().await?),
        Commands::Record { action } => match action {
            RecordAction::Start => outcome(proxy.start_recording().await?),
            RecordAction::Stop => outcome(proxy.stop_recording().await?),
        },
        Commands::Snapshot => outcome(proxy.snapshot().await?),
        Commands::Status => pretty(&proxy.status().await?),
        Commands::Add { name, image } => {
            // The daemon reads the file, so hand it an absolute path
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot read {}", image.display()))?;
            outcome(
                proxy
                    .add_known_person(&name, &image.to_string_lossy())
                    .await?,
            )
        }
        Commands::Remove { name } => outcome(proxy.remove_known_person(&name).await?),
        Commands::List => {
            let persons: Value = serde_json::from_str(&proxy.list_known_persons().await?)?;
            let persons = persons.as_array().cloned().unwrap_or_default();
            if persons.is_empty() {
                println!("No known persons");
            }
            for p in persons {
                println!(
                    "{:<24} added {}",
                    p["name"].as_str().unwrap_or("?"),
                    p["date_added"].as_str().unwrap_or("?")
                );
            }
            Ok(())
        }
        Commands::Detections { limit } => {
            let rows: Value = serde_json::from_str(&proxy.recent_detections(limit).await?)?;
            for d in rows.as_array().cloned().unwrap_or_default() {
                println!(
                    "{}  {:<20} {:.2}",
                    d["timestamp"].as_str().unwrap_or("?"),
                    d["person_name"].as_str().unwrap_or("Unknown"),
                    d["confidence"].as_f64().unwrap_or(0.0)
                );
            }
            Ok(())
        }
        Commands::Alerts => {
            let rows: Value = serde_json::from_str(&proxy.alerts().await?)?;
            let rows = rows.as_array().cloned().unwrap_or_default();
            if rows.is_empty() {
                println!("No pending alerts");
            }
            for a in rows {
                println!(
                    "#{:<5} {}  {}",
                    a["id"].as_i64().unwrap_or(0),
                    a["timestamp"].as_str().unwrap_or("?"),
                    a["description"].as_str().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Ack { id } => outcome(proxy.acknowledge_alert(id).await?),
        Commands::Stats => pretty(&proxy.statistics().await?),
        Commands::Report { date } => {
            pretty(&proxy.daily_report(date.as_deref().unwrap_or("")).await?)
        }
        Commands::Logs { limit } => {
            let rows: Value = serde_json::from_str(&proxy.recent_logs(limit).await?)?;
            for l in rows.as_array().cloned().unwrap_or_default() {
                println!(
                    "{}  {:<7} {}",
                    l["timestamp"].as_str().unwrap_or("?"),
                    l["level"].as_str().unwrap_or("?"),
                    l["message"].as_str().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Test => unreachable!("handled before connecting"),
    }
}

/// Print a control outcome; a rejected request exits non-zero.
fn outcome(json: String) -> Result<()> {
    let value: Value = serde_json::from_str(&json).context("malformed reply from vigild")?;
    let message = value["message"].as_str().unwrap_or("");
    let line = match value["detail"].as_str() {
        Some(detail) => format!("{message}: {detail}"),
        None => message.to_string(),
    };
    if value["success"].as_bool() == Some(true) {
        println!("{line}");
        Ok(())
    } else {
        bail!("{line}")
    }
}

fn pretty(json: &str) -> Result<()> {
    let value: Value = serde_json::from_str(json).context("malformed reply from vigild")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = vigil_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return Ok(());
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}
