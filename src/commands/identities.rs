use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Subcommand};
use serde::Serialize;

use super::OutputFormat;
use crate::config::{Config, IdentitiesConfig, default_identity_dir, find_config};
use crate::error::ExitError;
use crate::identity::{CommandQuotaChecker, IdentityPool, QUOTA_ERROR};

const QUOTA_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Subcommand)]
pub enum IdentitiesCommand {
    /// List the identities in the identity directory
    List(IdentitiesArgs),
    /// Query remaining quota for every identity
    Quota(IdentitiesArgs),
}

#[derive(Debug, Args)]
pub struct IdentitiesArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Identity directory (overrides the config)
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct IdentityRow {
    name: String,
    auth_kind: &'static str,
    home: String,
}

#[derive(Debug, Serialize)]
struct QuotaRow {
    name: String,
    percent: BTreeMap<String, i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resets_at: Option<String>,
}

impl IdentitiesCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            Self::List(args) => list(args),
            Self::Quota(args) => quota(args),
        }
    }
}

/// Identity settings from the project descriptor, if there is one.
fn identities_config(args: &IdentitiesArgs) -> anyhow::Result<(IdentitiesConfig, Option<PathBuf>)> {
    let root = super::project_root(args.project_root.as_deref())?;
    let config = find_config(&root).map(|p| Config::load(&p)).transpose()?;
    let dir = args.dir.clone().or_else(|| match &config {
        Some(c) => c.identity_dir(&root),
        None => default_identity_dir(),
    });
    Ok((config.map(|c| c.identities).unwrap_or_default(), dir))
}

fn load_pool(dir: Option<&Path>, settings: &IdentitiesConfig) -> anyhow::Result<IdentityPool> {
    let dir = dir.ok_or_else(|| ExitError::Config("no identity directory".into()))?;
    Ok(IdentityPool::load(dir, settings.pooling)?.with_categories(settings.categories.clone()))
}

fn list(args: &IdentitiesArgs) -> anyhow::Result<()> {
    let (settings, dir) = identities_config(args)?;
    let pool = load_pool(dir.as_deref(), &settings)?;
    let rows: Vec<IdentityRow> = pool
        .identities()
        .map(|i| IdentityRow {
            name: i.name.clone(),
            auth_kind: i.auth_kind.as_str(),
            home: i.home.display().to_string(),
        })
        .collect();

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            if rows.is_empty() {
                println!("No identities found.");
            }
            for row in rows {
                println!("{}  {}  {}", row.name, row.auth_kind, row.home);
            }
        }
    }
    Ok(())
}

fn quota(args: &IdentitiesArgs) -> anyhow::Result<()> {
    let (settings, dir) = identities_config(args)?;
    if settings.quota_command.is_empty() {
        return Err(ExitError::Config("identities.quota_command is not set".into()).into());
    }
    let mut pool = load_pool(dir.as_deref(), &settings)?;
    let checker = CommandQuotaChecker::new(settings.quota_command.clone(), QUOTA_TIMEOUT);
    let rows: Vec<QuotaRow> = pool
        .refresh_quota(&checker)
        .into_iter()
        .map(|(name, quota)| QuotaRow {
            name,
            resets_at: quota.resets_at.map(|t| t.to_rfc3339()),
            percent: quota.percent,
        })
        .collect();

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            for row in &rows {
                println!("{}  {}", row.name, format_percent(&row.percent));
            }
        }
    }
    Ok(())
}

fn format_percent(percent: &BTreeMap<String, i32>) -> String {
    if percent.is_empty() {
        return "no matching buckets".to_string();
    }
    percent
        .iter()
        .map(|(category, p)| {
            if *p == QUOTA_ERROR {
                format!("{category}=error")
            } else {
                format!("{category}={p}%")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_formatting() {
        let percent = BTreeMap::from([
            ("flash".to_string(), 80),
            ("pro".to_string(), QUOTA_ERROR),
        ]);
        assert_eq!(format_percent(&percent), "flash=80% pro=error");
        assert_eq!(format_percent(&BTreeMap::new()), "no matching buckets");
    }
}
