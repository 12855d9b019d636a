use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fieldbox")]
#[command(about = "Crash-resilient outbox for device telemetry")]
#[command(
    long_about = "Durable store-and-forward queue for sensor payloads.\n\n\
    Producers enqueue payloads into a SQLite-backed outbox; the upload\n\
    coordinator batches them per stream and posts them to the configured\n\
    ingestion endpoint, surviving crashes and connectivity outages."
)]
pub struct Cli {
    /// Path to fieldbox.toml (defaults to ./fieldbox.toml if present)
    #[arg(long, global = true, env = "FIELDBOX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Enqueue one payload for a stream
    #[command(after_help = "Examples:\n  \
        fieldbox enqueue health --data '{\"bpm\":62}'\n  \
        fieldbox enqueue audio --file chunk.ndjson\n  \
        cat batch.ndjson | fieldbox enqueue location")]
    Enqueue {
        /// Stream name (must be one of the configured streams)
        stream: String,

        /// Payload passed inline
        #[arg(long, conflicts_with = "file")]
        data: Option<String>,

        /// Read the payload from a file (stdin when neither is given)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Show queue statistics
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run one upload cycle now
    Sync,

    /// Run the upload coordinator until interrupted
    Run,

    /// Delete old completed/failed records
    Cleanup {
        /// Delete all completed records regardless of age
        #[arg(long)]
        aggressive: bool,
    },
}
