//! CLI parse: clap types for casework. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Casework CLI - staged clinical reasoning over generation providers
#[derive(Parser)]
#[command(name = "casework")]
#[command(about = "Run a case through staged analysis, diagnosis and treatment planning")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stderr, stdout, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Case records
    Case {
        #[command(subcommand)]
        command: CaseCommands,
    },
    /// Conversation history attached to a case
    Message {
        #[command(subcommand)]
        command: MessageCommands,
    },
    /// Run the patient case analysis group
    Start {
        case_id: String,
    },
    /// Run one backend stage or a whole group
    Process {
        case_id: String,
        /// Stage or group name, e.g. `causal_analysis` or `diagnosis_group`
        stage: String,
        /// Extra input for stages that accept it
        #[arg(long)]
        input: Option<String>,
    },
    /// Approve a stage result and advance the case
    Approve {
        case_id: String,
        stage: String,
    },
    /// Stream a stage or group as server-sent events on stdout
    Stream {
        case_id: String,
        stage: String,
        #[arg(long)]
        input: Option<String>,
    },
    /// Show the case record and every stored stage result
    Status {
        case_id: String,
    },
    /// Write the clinical note for a completed case
    Note {
        case_id: String,
    },
}

#[derive(Subcommand)]
pub enum CaseCommands {
    /// Create a case, or replace the text of an existing one
    Create {
        case_id: String,
        /// Case text
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        text: Option<String>,
        /// Read the case text from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum MessageCommands {
    /// Append a message (role: system, user, assistant)
    Add {
        case_id: String,
        role: String,
        content: String,
    },
    /// List messages, oldest first
    List {
        case_id: String,
    },
}
