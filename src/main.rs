use clap::Parser;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use treewatch::{
    cli::{Cli, OutputFormat},
    Registry, SemanticEvent, WatchEvent, WatchState,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();

    let config = cli.load_config()?;
    let mask = cli.event_mask(&config).map_err(anyhow::Error::msg)?;
    let watch_path = cli.get_watch_path();
    tracing::info!("Starting treewatch on: {}", watch_path.display());

    let registry = Registry::open(config)?;
    let handle = registry.watch(&watch_path, cli.recursive, mask);

    let (tx, rx) = mpsc::channel();
    handle.set_listener(move |event: &WatchEvent| {
        tx.send(event.clone()).context("output loop has exited")
    });
    handle
        .start()
        .wait()
        .with_context(|| format!("Failed to watch {}", watch_path.display()))?;

    if cli.output == OutputFormat::Text {
        println!("Watching: {}", handle.root().display());
        println!("Press Ctrl+C to quit");
        println!("---");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => print_event(&event, handle.root(), &cli)?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if handle.state() == WatchState::Idle {
                    tracing::info!("Watch root is gone, exiting");
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = handle.stop().wait_timeout(Duration::from_secs(1));
    registry.shutdown();
    Ok(())
}

fn print_event(event: &WatchEvent, root: &Path, cli: &Cli) -> Result<()> {
    match cli.output {
        OutputFormat::Text => print_text_event(event, root, cli),
        OutputFormat::Json => println!("{}", serde_json::to_string(&JsonEvent::new(event, root))?),
        OutputFormat::Compact => print_compact_event(event, root),
    }
    Ok(())
}

#[derive(Serialize)]
struct JsonEvent {
    time: DateTime<Local>,
    kind: &'static str,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    is_dir: bool,
}

impl JsonEvent {
    fn new(event: &WatchEvent, root: &Path) -> Self {
        Self {
            time: DateTime::<Local>::from(event.timestamp),
            kind: event.kind.label(),
            path: root.join(&event.path).display().to_string(),
            from: event
                .renamed_from()
                .map(|from| root.join(from).display().to_string()),
            is_dir: event.is_dir,
        }
    }
}

fn print_text_event(event: &WatchEvent, root: &Path, cli: &Cli) {
    let time_str = DateTime::<Local>::from(event.timestamp).format("%H:%M:%S");
    let path = root.join(&event.path);
    let target = match event.renamed_from() {
        Some(from) => format!("{} -> {}", root.join(from).display(), path.display()),
        None => path.display().to_string(),
    };
    let suffix = if event.is_dir { "/" } else { "" };

    if cli.no_color {
        println!("[{}] {} {}{}", time_str, event.kind, target, suffix);
    } else {
        let color = match &event.kind {
            SemanticEvent::Created => "\x1b[32m",        // Green
            SemanticEvent::Modified => "\x1b[33m",       // Yellow
            SemanticEvent::Deleted | SemanticEvent::SelfDeleted => "\x1b[31m", // Red
            SemanticEvent::Renamed { .. } | SemanticEvent::SelfMoved => "\x1b[34m", // Blue
            SemanticEvent::Overflow => "\x1b[35m",       // Magenta
        };
        println!("[{}] {}{}\x1b[0m {}{}", time_str, color, event.kind, target, suffix);
    }
}

fn print_compact_event(event: &WatchEvent, root: &Path) {
    let event_type = match &event.kind {
        SemanticEvent::Created => "C",
        SemanticEvent::Modified => "M",
        SemanticEvent::Deleted => "D",
        SemanticEvent::Renamed { .. } => "R",
        SemanticEvent::SelfDeleted => "X",
        SemanticEvent::SelfMoved => "V",
        SemanticEvent::Overflow => "!",
    };

    println!("{} {}", event_type, root.join(&event.path).display());
}
