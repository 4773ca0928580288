use std::path::PathBuf;
use clap::{Parser, ValueEnum};
use crate::config::TreewatchConfig;
use crate::EventMask;

#[derive(Parser)]
#[command(name = "treewatch")]
#[command(version = "0.1.0")]
#[command(about = "Recursive directory change notifications on top of inotify")]
#[command(long_about = "treewatch watches a directory, and optionally every directory below it, and prints one line per change. Renames are paired into a single event and new subdirectories are picked up as they appear.")]
pub struct Cli {
    /// Directory to watch for changes
    #[arg(value_name = "PATH", help = "Path to watch (defaults to current directory)")]
    pub path: Option<PathBuf>,

    /// Watch the whole tree below PATH
    #[arg(short, long, help = "Watch subdirectories recursively")]
    pub recursive: bool,

    /// Event kinds to report
    #[arg(long, value_delimiter = ',', help = "Events to watch (e.g., create,delete,move,modify,all)")]
    pub events: Option<Vec<String>>,

    /// Output format
    #[arg(long, default_value = "text", help = "Output format")]
    pub output: OutputFormat,

    /// Configuration file
    #[arg(long, value_name = "FILE", help = "TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Override the rename retention window
    #[arg(long, help = "How long a move-out waits for its move-in, in ms")]
    pub retention_ms: Option<u64>,

    /// Skip directories excluded by ignore files
    #[arg(long, help = "Do not descend into directories excluded by .gitignore/.ignore")]
    pub honor_ignore: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Disable colors in output
    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Timestamped, colored lines
    Text,
    /// One JSON object per line
    Json,
    /// Single-letter kind and path
    Compact,
}

impl Cli {
    pub fn get_watch_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// The configuration file (if any) with command-line overrides applied.
    pub fn load_config(&self) -> anyhow::Result<TreewatchConfig> {
        let mut config = TreewatchConfig::load_or_default(self.config.as_deref())?;
        if let Some(ms) = self.retention_ms {
            config.router.rename_retention_ms = ms;
        }
        if self.honor_ignore {
            config.install.honor_ignore_files = true;
        }
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Events selected on the command line, else the configured default.
    pub fn event_mask(&self, config: &TreewatchConfig) -> Result<EventMask, String> {
        match &self.events {
            Some(names) => EventMask::from_names(names),
            None => config.install.default_mask(),
        }
    }

    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_ansi(!self.no_color)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }

    pub fn validate(&self) -> Result<(), String> {
        let path = self.get_watch_path();

        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()));
        }

        if !path.is_dir() {
            return Err(format!("Path is not a directory: {}", path.display()));
        }

        if self.retention_ms == Some(0) {
            return Err("Retention must be greater than 0".to_string());
        }

        if let Some(names) = &self.events {
            EventMask::from_names(names)?;
        }

        Ok(())
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            path: None,
            recursive: false,
            events: None,
            output: OutputFormat::Text,
            config: None,
            retention_ms: None,
            honor_ignore: false,
            verbose: false,
            no_color: false,
        }
    }
}
