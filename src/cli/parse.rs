//! CLI parse: clap types for atelier. No behavior; definitions only.

use crate::queue::TaskState;
use crate::request::{DimensionPolicy, ResolutionTier};
use crate::types::{ArtifactRef, TaskId};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Atelier CLI - queue image generations and browse their history
#[derive(Parser)]
#[command(name = "atelier")]
#[command(about = "Queue image generations against a hosted model and browse the results")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (layered over the global config)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Cache directory for artifacts and history
    #[arg(long)]
    pub cache_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a generation and follow it until it finishes
    Generate {
        /// Prompt text
        #[arg(long)]
        prompt: String,
        /// Original image the result should follow
        #[arg(long)]
        primary: Option<PathBuf>,
        /// Reference image (repeatable, up to 10)
        #[arg(long = "reference")]
        references: Vec<PathBuf>,
        /// Things the result should avoid
        #[arg(long)]
        negative: Option<String>,
        /// Aspect ratio such as 16:9, or "auto" to follow the primary image
        #[arg(long, default_value = "auto")]
        aspect: DimensionPolicy,
        /// Resolution tier (1K, 2K, 4K)
        #[arg(long, default_value = "2K")]
        resolution: ResolutionTier,
        /// Tag images by role in the prompt
        #[arg(long)]
        optimize: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "900")]
        wait_secs: u64,
    },
    /// List recorded generations, newest first
    History {
        /// Maximum entries to show
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Only entries in this state (succeeded, failed)
        #[arg(long)]
        state: Option<TaskState>,
        /// Only entries whose prompt contains this text
        #[arg(long)]
        search: Option<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show one history entry
    Show {
        task_id: TaskId,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Delete a history entry
    Purge {
        task_id: TaskId,
        /// Also delete its images unless another entry uses them
        #[arg(long)]
        with_artifacts: bool,
    },
    /// Copy a stored image to a file
    Export {
        artifact: ArtifactRef,
        out: PathBuf,
    },
}
