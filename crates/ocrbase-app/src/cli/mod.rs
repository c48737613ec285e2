use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Default, Debug, Parser)]
#[command(
    name = "ocrbase",
    version,
    author,
    about = "Document OCR and structured extraction pipeline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP API together with the worker pool.
    Serve(ServeArgs),
    /// Run only the worker pool against the shared stores.
    Worker(WorkerArgs),
    /// Manage the extraction schema registry.
    Schema(SchemaArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

#[derive(Debug, Args)]
pub struct WorkerArgs;

#[derive(Debug, Args)]
pub struct SchemaArgs {
    #[command(subcommand)]
    pub command: SchemaCommands,
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommands {
    /// Register a JSON Schema document (full schema or `{field: type}`
    /// shorthand) and print its id.
    Add(SchemaAddArgs),
    /// List registered schemas.
    List,
    /// Ask the extraction model to draft a schema from a markdown file.
    Generate(SchemaGenerateArgs),
}

#[derive(Debug, Args)]
pub struct SchemaAddArgs {
    /// Path to a JSON file holding the schema.
    pub input: PathBuf,
}

#[derive(Debug, Args)]
pub struct SchemaGenerateArgs {
    /// Path to a markdown file to derive the schema from.
    pub input: PathBuf,
    /// Free-text guidance for the model.
    #[arg(long)]
    pub hints: Option<String>,
    /// Register the generated schema instead of only printing it.
    #[arg(long)]
    pub register: bool,
}
