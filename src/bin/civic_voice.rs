//! Terminal front-end for a civic voice session.
//!
//! Reads line commands from stdin (`start`, `talk`, `stop`, `tickets`,
//! `quit`) and prints status changes and newly logged tickets to stdout.
//! Diagnostic output goes to stderr and, optionally, a daily log file.

use anyhow::Context as _;
use civic_voice::audio::capture::CpalMicrophone;
use civic_voice::audio::playback::CpalOutput;
use civic_voice::channel::WebSocketTransport;
use civic_voice::{SessionClient, SessionRuntime, TicketStore, VoiceConfig, app_dirs};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const USAGE: &str = "usage: civic-voice [--config PATH] [devices]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut list_devices = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                config_path = Some(args.next().map(PathBuf::from).context(USAGE)?);
            }
            "devices" => list_devices = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => anyhow::bail!("unknown argument '{other}'\n{USAGE}"),
        }
    }

    let mut config = load_config(config_path)?;
    let _log_guard = init_tracing(&config);

    if list_devices {
        return print_devices();
    }

    if config.remote.api_key.is_none() {
        config.remote.api_key = std::env::var("GEMINI_API_KEY").ok();
    }
    if config.remote.api_key.is_none() {
        tracing::warn!("no API key configured; set remote.api_key or GEMINI_API_KEY");
    }

    let transport = WebSocketTransport::new(&config.remote)?;
    let microphone = CpalMicrophone::new(&config.audio);
    let output = CpalOutput::open(&config.audio).context("opening speaker")?;
    let store = if config.tickets.seed_demo_data {
        TicketStore::with_demo_data()
    } else {
        TicketStore::new()
    };

    let (runtime, client) = SessionRuntime::new(
        config,
        Arc::new(transport),
        Arc::new(microphone),
        Arc::new(output),
        store,
    );
    let runtime = tokio::spawn(runtime.run());

    spawn_status_printer(&client);
    spawn_ticket_printer(&client);

    println!("Civic Voice v{}", env!("CARGO_PKG_VERSION"));
    println!("Commands: start, talk, stop, tickets, quit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "start" => client.start().await?,
                    "talk" => client.begin_capture().await?,
                    "stop" => client.stop().await?,
                    "tickets" => print_tickets(client.tickets()),
                    "quit" | "exit" => break,
                    other => println!("unknown command '{other}'"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    tracing::info!("received Ctrl+C, shutting down...");
                }
                break;
            }
        }
    }

    drop(client);
    let reports = runtime.await?;
    let tickets: usize = reports.iter().map(|r| r.tickets.len()).sum();
    tracing::info!(sessions = reports.len(), tickets, "civic-voice shut down cleanly");
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<VoiceConfig> {
    match path {
        Some(path) => VoiceConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let default = VoiceConfig::default_config_path();
            if default.exists() {
                VoiceConfig::from_file(&default)
                    .with_context(|| format!("loading config from {}", default.display()))
            } else {
                Ok(VoiceConfig::default())
            }
        }
    }
}

fn init_tracing(config: &VoiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("civic_voice=info,civic_voice_bin=info,warn"));

    let (file_layer, guard) = if config.logging.file {
        let dir = config
            .logging
            .dir
            .clone()
            .unwrap_or_else(app_dirs::logs_dir);
        let appender = tracing_appender::rolling::daily(dir, "civic-voice.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

fn spawn_status_printer(client: &SessionClient) {
    let mut status = client.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snap = status.borrow_and_update().clone();
            if snap.is_error {
                println!("[{:?}] error: {}", snap.phase, snap.message);
            } else {
                println!("[{:?}] {}", snap.phase, snap.message);
            }
        }
    });
}

fn spawn_ticket_printer(client: &SessionClient) {
    let store = client.tickets().clone();
    let mut created = store.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = created.recv().await {
            if let Some(t) = store.get(&event.ticket_id) {
                println!(
                    "Ticket {} logged: [{}] {} at {} ({})",
                    t.id, t.severity, t.category, t.location, t.impact
                );
            }
        }
    });
}

fn print_tickets(store: &TicketStore) {
    let summary = store.summary();
    println!(
        "{} tickets, {} open, {} critical",
        summary.total, summary.open, summary.critical
    );
    for t in store.snapshot() {
        println!(
            "  {:<9} {:<8} {:<11} {:<13} {} @ {}  (Impact: {})",
            t.id,
            t.severity.to_string(),
            t.status.to_string(),
            t.category,
            t.description,
            t.location,
            t.impact
        );
    }
}

fn print_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalMicrophone::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
