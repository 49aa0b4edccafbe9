use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::deck::DEFAULT_DECK;
use crate::sync::orchestrator::RunOptions;

pub const DEFAULT_ANKI_URL: &str = "http://localhost:8765";
const DEFAULT_WORKERS: u64 = 4;
const DEFAULT_RENDER_CONCURRENCY: u64 = 2;
const DEFAULT_REMOTE_RETRIES: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub root: PathBuf,
    pub cache_file: PathBuf,
    pub anki_url: String,
    pub default_deck: String,
    pub deck_rules: Option<PathBuf>,
    pub ignore: Vec<PathBuf>,
    pub workers: usize,
    pub render_concurrency: usize,
    pub remote_retries: u32,
    pub track_deletions: bool,
    pub checkpoint_per_file: bool,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let cwd = std::env::current_dir().context("current directory is unavailable")?;
        Ok(Self::from_lookup(
            |name| std::env::var(name).ok(),
            &home,
            &cwd,
        ))
    }

    /// Builds the config from `lookup`, resolving `~` against `home` and
    /// the default root to `cwd`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, home: &Path, cwd: &Path) -> Self {
        let path_var = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .map(|value| expand_with_home(value.trim(), home))
        };
        let root = path_var("CLOZESYNC_ROOT").unwrap_or_else(|| cwd.to_path_buf());
        let cache_file = path_var("CLOZESYNC_CACHE_FILE").unwrap_or_else(default_cache_file);
        let anki_url = lookup("CLOZESYNC_ANKI_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ANKI_URL.to_string());
        let default_deck = lookup("CLOZESYNC_DEFAULT_DECK")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_DECK.to_string());
        let deck_rules = path_var("CLOZESYNC_DECK_RULES");
        let ignore = lookup("CLOZESYNC_IGNORE")
            .map(|value| {
                value
                    .split(':')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(|entry| expand_with_home(entry, home))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            root,
            cache_file,
            anki_url,
            default_deck,
            deck_rules,
            ignore,
            workers: read_u64(&lookup, "CLOZESYNC_WORKERS", DEFAULT_WORKERS) as usize,
            render_concurrency: read_u64(
                &lookup,
                "CLOZESYNC_RENDER_CONCURRENCY",
                DEFAULT_RENDER_CONCURRENCY,
            ) as usize,
            remote_retries: read_u64(&lookup, "CLOZESYNC_REMOTE_RETRIES", DEFAULT_REMOTE_RETRIES)
                .min(u64::from(u32::MAX)) as u32,
            track_deletions: read_bool(&lookup, "CLOZESYNC_TRACK_DELETIONS", true),
            checkpoint_per_file: read_bool(&lookup, "CLOZESYNC_CHECKPOINT_PER_FILE", false),
        }
    }

    /// Run options derived from the config; CLI flags are applied on top.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            track_deletions: self.track_deletions,
            checkpoint_per_file: self.checkpoint_per_file,
            workers: self.workers,
            render_concurrency: self.render_concurrency,
            ..RunOptions::default()
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_cache_file() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("clozesync")
        .join("cache.json")
}

fn read_u64(lookup: impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool(lookup: impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
