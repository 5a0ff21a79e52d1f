use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keyremapd")]
#[command(about = "Dual-role key remapper: hold for one key, tap for another")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compile the config file and report errors, without starting the hook.
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print every key name the config file can reference.
    ListKeys,
}
