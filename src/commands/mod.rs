pub mod identities;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::schema_for;

use crate::config::{CONFIG_JSON, CONFIG_TOML, Config, find_config};
use crate::error::ExitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// `--project-root`, else the current directory.
pub fn project_root(arg: Option<&Path>) -> anyhow::Result<PathBuf> {
    match arg {
        Some(p) => Ok(p.to_path_buf()),
        None => std::env::current_dir().context("determining project root"),
    }
}

/// Load the project descriptor from `root`.
pub fn load_config(root: &Path) -> anyhow::Result<Config> {
    let path = find_config(root).ok_or_else(|| {
        ExitError::Config(format!(
            "no {CONFIG_TOML} or {CONFIG_JSON} in {}",
            root.display()
        ))
    })?;
    Config::load(&path)
}

/// Print the JSON Schema for the project descriptor to stdout.
pub fn run_schema() -> anyhow::Result<()> {
    let schema = schema_for!(Config);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
