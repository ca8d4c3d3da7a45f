//! Credential pool.
//!
//! Identities are loaded once from a directory with one subdirectory per
//! identity. Selection is round-robin over identities that are not marked
//! exhausted. Exhaustion is sticky: it clears only when a quota refresh
//! shows capacity again or an operator clears it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::IDENTITY_FILE;
use crate::error::DispatchError;
use crate::subprocess::Tool;

/// Percentage reported for every category when a quota query fails.
pub const QUOTA_ERROR: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    #[serde(alias = "oauth-personal", alias = "login")]
    Oauth,
    #[serde(alias = "api_key", alias = "gemini-api-key")]
    ApiKey,
    #[serde(alias = "vertex-ai")]
    Vertex,
    #[serde(other)]
    Other,
}

impl AuthKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Oauth => "oauth",
            Self::ApiKey => "api-key",
            Self::Vertex => "vertex",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub auth_kind: AuthKind,
    /// HOME for worker processes running as this identity.
    pub home: PathBuf,
}

#[derive(Debug, Deserialize)]
struct IdentityRecord {
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_auth_kind", alias = "authKind", alias = "auth")]
    auth_kind: AuthKind,
    #[serde(default, alias = "homeDirectory", alias = "home_directory")]
    home: Option<PathBuf>,
}

const fn default_auth_kind() -> AuthKind {
    AuthKind::Oauth
}

/// One quota bucket as reported by the quota command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaBucket {
    pub model_id: String,
    pub remaining_fraction: f64,
    #[serde(default)]
    pub reset_time: Option<DateTime<Utc>>,
}

/// Remaining capacity per category, as whole percentages.
/// [`QUOTA_ERROR`] marks a category whose query failed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Quota {
    pub percent: BTreeMap<String, i32>,
    pub resets_at: Option<DateTime<Utc>>,
}

impl Quota {
    fn failed(categories: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            percent: categories.keys().map(|c| (c.clone(), QUOTA_ERROR)).collect(),
            resets_at: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.percent.values().any(|p| *p == QUOTA_ERROR)
    }

    /// Any category with capacity left.
    pub fn has_capacity(&self) -> bool {
        self.percent.values().any(|p| *p > 0)
    }

    /// Minimum fraction per category. Buckets for unknown models are ignored;
    /// categories with no bucket are left out.
    pub fn from_buckets(buckets: &[QuotaBucket], categories: &BTreeMap<String, Vec<String>>) -> Self {
        let mut min: BTreeMap<String, f64> = BTreeMap::new();
        for bucket in buckets {
            let Some(category) = category_for_model(&bucket.model_id, categories) else {
                continue;
            };
            let fraction = bucket.remaining_fraction.clamp(0.0, 1.0);
            min.entry(category.to_string())
                .and_modify(|m| *m = m.min(fraction))
                .or_insert(fraction);
        }
        let resets_at = buckets.iter().filter_map(|b| b.reset_time).min();
        #[allow(clippy::cast_possible_truncation)]
        let percent = min
            .into_iter()
            .map(|(c, f)| (c, (f * 100.0).round() as i32))
            .collect();
        Self { percent, resets_at }
    }
}

/// Category a model id belongs to: the first category (by name) with a
/// substring contained in the id.
pub fn category_for_model<'a>(
    model_id: &str,
    categories: &'a BTreeMap<String, Vec<String>>,
) -> Option<&'a str> {
    let model = model_id.to_lowercase();
    categories
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| model.contains(&n.to_lowercase())))
        .map(|(c, _)| c.as_str())
}

/// Source of quota buckets for one identity.
pub trait QuotaChecker {
    fn check(&self, identity: &Identity) -> anyhow::Result<Vec<QuotaBucket>>;
}

/// Runs a configured command with the identity's HOME and parses its JSON.
pub struct CommandQuotaChecker {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandQuotaChecker {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuotaReply {
    Wrapped { buckets: Vec<QuotaBucket> },
    Bare(Vec<QuotaBucket>),
}

impl QuotaChecker for CommandQuotaChecker {
    fn check(&self, identity: &Identity) -> anyhow::Result<Vec<QuotaBucket>> {
        let (program, args) = self
            .command
            .split_first()
            .context("quota command is empty")?;
        let output = Tool::new(program)
            .args(args)
            .env("HOME", &identity.home.to_string_lossy())
            .timeout(self.timeout)
            .run_ok()?;
        let reply: QuotaReply = output.parse_json()?;
        Ok(match reply {
            QuotaReply::Wrapped { buckets } | QuotaReply::Bare(buckets) => buckets,
        })
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    identity: Identity,
    exhausted_at: Option<Instant>,
    quota: Option<Quota>,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityPool {
    entries: Vec<PoolEntry>,
    pooling: bool,
    cursor: usize,
    categories: BTreeMap<String, Vec<String>>,
}

impl IdentityPool {
    pub fn new(identities: Vec<Identity>, pooling: bool) -> Self {
        Self {
            entries: identities
                .into_iter()
                .map(|identity| PoolEntry {
                    identity,
                    exhausted_at: None,
                    quota: None,
                })
                .collect(),
            pooling,
            cursor: 0,
            categories: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_categories(mut self, categories: BTreeMap<String, Vec<String>>) -> Self {
        self.categories = categories;
        self
    }

    /// Scan `dir` for identity subdirectories. A missing directory yields an
    /// empty pool; unreadable or malformed records are skipped.
    pub fn load(dir: &Path, pooling: bool) -> anyhow::Result<Self> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "identity directory missing");
            return Ok(Self::new(Vec::new(), pooling));
        }
        let mut subdirs: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        subdirs.sort();

        let identities = subdirs
            .iter()
            .filter_map(|sub| match load_record(sub) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    tracing::warn!(path = %sub.display(), error = %format!("{e:#}"), "skipping identity");
                    None
                }
            })
            .collect();
        Ok(Self::new(identities, pooling))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn pooling(&self) -> bool {
        self.pooling
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.iter().map(|e| &e.identity)
    }

    const fn rotates(&self) -> bool {
        self.pooling && self.entries.len() > 1
    }

    /// Whether [`Self::next_available`] would hand out an identity.
    pub fn has_available(&self) -> bool {
        !self.rotates() || self.entries.iter().any(|e| e.exhausted_at.is_none())
    }

    /// Pick the identity for the next worker launch.
    ///
    /// `Ok(None)` means there are no identities at all and the worker runs
    /// with the ambient credentials.
    pub fn next_available(&mut self) -> Result<Option<Identity>, DispatchError> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        if !self.rotates() {
            return Ok(Some(self.entries[0].identity.clone()));
        }
        let n = self.entries.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.entries[idx].exhausted_at.is_none() {
                self.cursor = (idx + 1) % n;
                return Ok(Some(self.entries[idx].identity.clone()));
            }
        }
        Err(DispatchError::NoAvailableIdentity)
    }

    pub fn mark_exhausted(&mut self, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.identity.name == name) {
            entry.exhausted_at = Some(Instant::now());
            tracing::info!(identity = name, "identity marked exhausted");
        }
    }

    pub fn clear_exhausted(&mut self, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.identity.name == name) {
            entry.exhausted_at = None;
        }
    }

    pub fn is_exhausted(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.identity.name == name && e.exhausted_at.is_some())
    }

    pub fn exhausted_since(&self, name: &str) -> Option<Instant> {
        self.entries
            .iter()
            .find(|e| e.identity.name == name)
            .and_then(|e| e.exhausted_at)
    }

    pub fn quota(&self, name: &str) -> Option<&Quota> {
        self.entries
            .iter()
            .find(|e| e.identity.name == name)
            .and_then(|e| e.quota.as_ref())
    }

    /// Query every identity. A failed query marks only that identity's
    /// categories with [`QUOTA_ERROR`]. Identities showing capacity again
    /// have their exhaustion cleared.
    pub fn refresh_quota(&mut self, checker: &dyn QuotaChecker) -> BTreeMap<String, Quota> {
        let mut report = BTreeMap::new();
        for entry in &mut self.entries {
            let quota = match checker.check(&entry.identity) {
                Ok(buckets) => Quota::from_buckets(&buckets, &self.categories),
                Err(e) => {
                    tracing::warn!(
                        identity = %entry.identity.name,
                        error = %format!("{e:#}"),
                        "quota check failed"
                    );
                    Quota::failed(&self.categories)
                }
            };
            if entry.exhausted_at.is_some() && !quota.is_error() && quota.has_capacity() {
                tracing::info!(identity = %entry.identity.name, "quota restored, clearing exhaustion");
                entry.exhausted_at = None;
            }
            entry.quota = Some(quota.clone());
            report.insert(entry.identity.name.clone(), quota);
        }
        report
    }
}

fn load_record(dir: &Path) -> anyhow::Result<Identity> {
    let path = dir.join(IDENTITY_FILE);
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let record: IdentityRecord =
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;

    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = record
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(dir_name);
    let home = match record.home {
        Some(h) if h.is_absolute() => h,
        Some(h) => dir.join(h),
        None => dir.to_path_buf(),
    };
    Ok(Identity {
        name,
        auth_kind: record.auth_kind,
        home,
    })
}
