#![allow(clippy::pedantic)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::{error, info};

use keyremapd::cli::{Cli, Commands};
use keyremapd::config::{self, GlobalOptions};
use keyremapd::engine::StateEngine;
use keyremapd::error::CoreError;
use keyremapd::hook::HookAdapter;
use keyremapd::single_instance::SingleInstanceGuard;

const DEFAULT_CONFIG: &str = concat!(
    "# keyremapd config — see the project README for the full option reference.\n",
    "tap_timeout=200\n",
    "\n",
    "remap_key=KC_CAPS\n",
    "when_alone=KC_ESC\n",
    "with_other=KC_LCTL\n",
);

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Validate { config }) => run_validate(config.as_deref()),
        Some(Commands::ListKeys) => run_list_keys(),
        None => run_daemon(),
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(false)
        .init();
}

fn debug_requested(options: &GlobalOptions) -> bool {
    options.debug
        || std::env::var("DEBUG")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
}

fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    config::default_path().context("couldn't determine a default config directory")
}

fn ensure_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("couldn't create {}", dir.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("couldn't write default config to {}", path.display()))
}

fn run_daemon() -> Result<()> {
    let path = resolve_config_path(None)?;
    ensure_default_config(&path)?;
    let (parsed, catalog) = config::load(&path)?;

    init_logging(debug_requested(&parsed.options));
    info!(path = %path.display(), "loaded config");

    let _guard = SingleInstanceGuard::acquire()?;

    let rehook_timeout = parsed.options.rehook_timeout;
    let engine_config = parsed.options.to_engine_config();
    let mut engine = StateEngine::new(parsed.ruleset, parsed.layers, catalog, engine_config);

    let mut hook = HookAdapter::new(rehook_timeout)?;
    hook.run(&mut engine)
}

fn run_validate(config_path: Option<&Path>) -> Result<()> {
    println!();
    println!("{}", "═══════════════════════════════════════".bright_cyan());
    println!("  {}", "Config Validation".bright_cyan().bold());
    println!("{}", "═══════════════════════════════════════".bright_cyan());
    println!();

    let path = resolve_config_path(config_path)?;
    println!(
        "  {} {}",
        "Config file:".bright_yellow(),
        path.display().to_string().dimmed()
    );
    println!();

    print!("  {} Loading and compiling... ", "→".bright_blue());
    let outcome = config::load(&path);

    match outcome {
        Ok((parsed, _catalog)) => {
            println!("{}", "✓".bright_green().bold());
            println!();
            println!(
                "  {} {} rule(s), {} layer(s)",
                "✓".bright_green().bold(),
                parsed.ruleset.len(),
                parsed.layers.len()
            );
            println!();
            println!("{}", "═══════════════════════════════════════".bright_cyan());
            println!("  {} {}", "✓".bright_green().bold(), "Config is valid!".bright_green());
            println!("{}", "═══════════════════════════════════════".bright_cyan());
            println!();
            Ok(())
        }
        Err(e) => {
            println!("{}", "✗".bright_red().bold());
            println!();
            if let Some(core) = e.chain().find_map(|c| c.downcast_ref::<CoreError>()) {
                println!("  {} {}", "Error:".bright_red().bold(), core);
            } else {
                println!("  {} {:#}", "Error:".bright_red().bold(), e);
            }
            println!();
            println!("{}", "═══════════════════════════════════════".bright_cyan());
            println!();
            Err(e)
        }
    }
}

fn run_list_keys() -> Result<()> {
    let catalog = keyremapd::catalog::KeyCatalog::new();
    println!();
    println!("{}", "═══════════════════════════════════════".bright_cyan());
    println!("  {}", "Known Key Names".bright_cyan().bold());
    println!("{}", "═══════════════════════════════════════".bright_cyan());
    println!();
    for name in catalog.names() {
        println!("    {name}");
    }
    println!();
    Ok(())
}
