//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Machine monitoring slot engine.
///
/// Reconciles machine state change events into contiguous time slot
/// partitions and keeps per-day duration summaries up to date.
#[derive(Debug, Parser)]
#[command(name = "mt", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the database and seed the built-in catalog.
    Init,

    /// Apply a change event to a machine's partitions.
    Apply {
        #[command(subcommand)]
        event: ApplyEvent,
    },

    /// Process pending day/shift templates up to a scan limit.
    Expand {
        /// The machine to process.
        #[arg(long)]
        machine: String,

        /// Scan limit (RFC 3339). Defaults to 7 days from now.
        #[arg(long)]
        until: Option<String>,
    },

    /// Print per-day duration summaries.
    Report {
        /// The machine to report on.
        #[arg(long)]
        machine: String,

        /// Emit JSON instead of the human-readable table.
        #[arg(long)]
        json: bool,
    },

    /// Show machines and pending modification counts.
    Status,

    /// Dump the analysis log.
    Log {
        /// Minimum severity to include (info, warn, error).
        #[arg(long)]
        severity: Option<String>,
    },

    /// Delete completed modifications.
    Purge {
        /// Delete done modifications created before this instant (RFC 3339).
        #[arg(long)]
        before: String,
    },
}

/// Change events that can be applied.
#[derive(Debug, Subcommand)]
pub enum ApplyEvent {
    /// The machine was in an observation state over a range.
    ObservationState {
        /// The machine the assertion is about.
        #[arg(long)]
        machine: String,

        /// The observation state id.
        #[arg(long)]
        state: String,

        /// Range start (RFC 3339).
        #[arg(long)]
        from: String,

        /// Range end (RFC 3339); open-ended when omitted.
        #[arg(long)]
        to: Option<String>,

        /// The shift in effect, if any.
        #[arg(long)]
        shift: Option<String>,

        /// Run all cascaded steps in this pass.
        #[arg(long)]
        synchronous: bool,
    },

    /// The machine ran in a mode over a range.
    Activity {
        /// The machine the assertion is about.
        #[arg(long)]
        machine: String,

        /// The machine mode id.
        #[arg(long)]
        mode: String,

        /// Range start (RFC 3339).
        #[arg(long)]
        from: String,

        /// Range end (RFC 3339); open-ended when omitted.
        #[arg(long)]
        to: Option<String>,

        /// Run all cascaded steps in this pass.
        #[arg(long)]
        synchronous: bool,
    },

    /// An operator asserted (or cleared) a reason over a range.
    Reason {
        /// The machine the assertion is about.
        #[arg(long)]
        machine: String,

        /// The reason id; omitting it re-evaluates defaults.
        #[arg(long)]
        reason: Option<String>,

        /// Score of the assertion; defaults to the manual score.
        #[arg(long)]
        score: Option<f64>,

        /// Range start (RFC 3339).
        #[arg(long)]
        from: String,

        /// Range end (RFC 3339); open-ended when omitted.
        #[arg(long)]
        to: Option<String>,

        /// Run all cascaded steps in this pass.
        #[arg(long)]
        synchronous: bool,
    },

    /// Associate a day or shift template from an instant onwards.
    Template {
        /// The machine the association is about.
        #[arg(long)]
        machine: String,

        /// The template id.
        #[arg(long)]
        template: String,

        /// Effective from (RFC 3339); aligned to the next day boundary.
        #[arg(long)]
        from: String,

        /// Treat the template as a shift template.
        #[arg(long)]
        shift: bool,
    },
}
