use std::path::PathBuf;

use clap::{Parser, Subcommand};

use autoupload::config::CONFIG_FILE;

/// Watch a recordings directory and upload every finished video.
///
/// autoupload waits for each new file to be released by the program recording
/// it, then streams it to the video host and goes back to watching.
#[derive(Parser, Debug)]
#[command(
    name = "autoupload",
    version,
    about,
    long_about = None,
    propagate_version = true,
)]
pub struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Emit logs as JSON lines (for service log collectors).
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the configured directory and upload new recordings until interrupted.
    Run {
        /// Directory to watch (overrides `watch_directory` from the config file).
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Wait until a file is no longer being written, then report how long it took.
    Probe {
        /// File to probe.
        file: PathBuf,

        /// Output results as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },

    /// Upload a single file right away, printing progress.
    ///
    /// The file is probed first, exactly as in `run`.
    Upload {
        /// File to upload.
        file: PathBuf,

        /// Output results as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },
}
