use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Duration;

use journey_tracker::service::{
    reading_events, PassiveSensors, ServiceEvent, ShutdownSummary, TrackingService,
};
use journey_tracker::storage::JourneyStore;
use journey_tracker::trace::{TraceLog, TraceReading};
use journey_tracker::transport::{upload_queue, LineTransport, LogBlob};
use journey_tracker::{Journey, Settings};

#[derive(Parser, Debug)]
#[command(name = "journey_tracker")]
#[command(about = "GPS journey segmentation, storage and upload", long_about = None)]
struct Args {
    /// Directory holding the journey files
    #[arg(long, global = true, default_value = "journey_data")]
    data_dir: PathBuf,

    /// JSON settings file; missing fields keep their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a recorded sensor log (.json or .json.gz) through the tracker
    Replay {
        #[arg(long)]
        log: PathBuf,
    },

    /// Track live from JSON readings on stdin, one per line
    Listen {
        /// Watchdog poll period (ms)
        #[arg(long, default_value = "250")]
        tick_ms: u64,
    },

    /// Post-process raw journeys into the upload queue
    Postprocess,

    /// Print stored journeys
    List {
        /// Show the personal history instead of the upload queue
        #[arg(long)]
        history: bool,
    },

    /// Send processed journeys to the collection server
    Upload {
        /// Server address (host:port)
        #[arg(long)]
        addr: String,

        /// Text file sent as log data after the journeys
        #[arg(long)]
        log: Option<PathBuf>,

        /// Profile used when asking for a client id: "gender age position car"
        #[arg(long, default_value = "0 0 0 0")]
        profile: String,

        /// Drop uploaded journeys instead of moving them to the history
        #[arg(long)]
        discard: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = match args.config.as_deref() {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    let store = JourneyStore::open(args.data_dir.clone())
        .with_context(|| format!("opening data directory {}", args.data_dir.display()))?;

    match args.command {
        Command::Replay { log } => replay(settings, store, &log),
        Command::Listen { tick_ms } => listen(settings, store, tick_ms).await,
        Command::Postprocess => {
            let kept = store.post_process(&settings.postprocess)?;
            println!("{} journeys ready for upload", kept);
            Ok(())
        }
        Command::List { history } => list(&store, history),
        Command::Upload {
            addr,
            log,
            profile,
            discard,
        } => upload(&store, &addr, log.as_deref(), &profile, discard).await,
    }
}

fn replay(settings: Settings, store: JourneyStore, path: &Path) -> Result<()> {
    let trace = TraceLog::load(path).with_context(|| format!("reading {}", path.display()))?;
    log::info!("[CLI] replaying {} readings from {}", trace.readings.len(), path.display());

    let mut service = TrackingService::new(settings, PassiveSensors, store)?;
    service.replay(&trace.readings)?;
    print_summary(service.shutdown()?);
    Ok(())
}

async fn listen(settings: Settings, store: JourneyStore, tick_ms: u64) -> Result<()> {
    let min_satellites = settings.gps.min_satellites;
    let service = TrackingService::new(settings, PassiveSensors, store)?;

    let tx = service.sender();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<TraceReading>(&line) {
                    Ok(reading) => {
                        for event in reading_events(&reading, min_satellites) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => log::warn!("[CLI] skipping reading: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    log::error!("[CLI] stdin: {}", e);
                    break;
                }
            }
        }
        let _ = tx.send(ServiceEvent::Stop { by_user: true });
    });

    let stop_tx = service.sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("[CLI] interrupted");
            let _ = stop_tx.send(ServiceEvent::Stop { by_user: true });
        }
    });

    let summary = service.run(Duration::from_millis(tick_ms)).await?;
    print_summary(summary);
    Ok(())
}

fn list(store: &JourneyStore, history: bool) -> Result<()> {
    let journeys = if history {
        store.load_history()?
    } else {
        store.load_processed()?
    };
    if journeys.is_empty() {
        println!("No journeys");
        return Ok(());
    }
    for j in &journeys {
        print_journey(j);
    }
    Ok(())
}

fn print_journey(j: &Journey) {
    println!(
        "{:>14}  {} {}  {:>5} points  {:>7.0} m  {} / {}  {:?}",
        j.id,
        j.title(),
        j.times(),
        j.len(),
        j.diagonal_span(),
        j.mode,
        j.purpose.label(),
        j.reason.reasons()
    );
}

async fn upload(
    store: &JourneyStore,
    addr: &str,
    log_file: Option<&Path>,
    profile: &str,
    discard: bool,
) -> Result<()> {
    let queued = store.load_processed()?.len();
    let blob = match log_file {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(LogBlob {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                lines: text.lines().map(String::from).collect(),
            })
        }
        None => None,
    };
    if queued == 0 && blob.is_none() {
        println!("Nothing to upload");
        return Ok(());
    }

    let client_id = store.load_client_id()?.unwrap_or_default();
    let mut transport = LineTransport::tcp(addr, &client_id)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    let report = upload_queue(&mut transport, store, profile, blob.as_ref(), discard).await?;
    println!("{} of {} journeys uploaded", report.uploaded, report.queued);
    if blob.is_some() && !report.log_sent {
        println!("Log data not sent");
    }
    Ok(())
}

fn print_summary(summary: ShutdownSummary) {
    println!(
        "{} journeys recorded, {} ready for upload",
        summary.written, summary.processed
    );
}
