//! Command-line interface and config loading.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use acf_domain::config::Config;

#[derive(Parser)]
#[command(name = "acfd", about = "Agent Conversation Fabric server")]
pub struct Cli {
    /// Path to the TOML config file (default: ./acf.toml, or $ACF_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server (default).
    Serve,
    /// Config inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Load configuration.  Resolution order: `--config`, `$ACF_CONFIG`,
/// `./acf.toml`.  A missing file yields the built-in defaults.
pub fn load_config(cli_path: Option<&PathBuf>) -> anyhow::Result<(Config, PathBuf)> {
    let path = cli_path
        .cloned()
        .or_else(|| std::env::var("ACF_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("acf.toml"));

    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, path))
}

/// Print the effective configuration as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}

/// Validate and print issues.  Returns false when any error exists.
pub fn validate(config: &Config, path: &std::path::Path) -> bool {
    use acf_domain::config::ConfigSeverity;

    let issues = config.validate();
    if issues.is_empty() {
        println!("{}: OK", path.display());
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error)
}
