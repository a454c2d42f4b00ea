use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::schema::{Locator, LocatorStrategy};

/// Resolution operation kind, part of the memory key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Tap,
    Input,
    Toggle,
    Assert,
    Scroll,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Tap => "tap",
            Operation::Input => "input",
            Operation::Toggle => "toggle",
            Operation::Assert => "assert",
            Operation::Scroll => "scroll",
        }
    }
}

const MAX_CANDIDATES: usize = 6;
const NO_SCREEN: &str = "-";

/// One remembered locator with its reinforcement counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorCandidate {
    pub strategy: LocatorStrategy,
    pub value: String,
    pub successes: u32,
    pub failures: u32,
    pub last_seen: DateTime<Utc>,
}

impl SelectorCandidate {
    pub fn score(&self) -> i64 {
        3 * self.successes as i64 - 2 * self.failures as i64
    }

    fn matches(&self, locator: &Locator) -> bool {
        self.strategy == locator.strategy && self.value == locator.value
    }

    fn to_locator(&self) -> Locator {
        Locator::new(self.strategy, &self.value)
    }
}

static PURE_POSITIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/{1,2}\*(\[\d+\])?)+$").unwrap());

/// Genericity filter: expressions too brittle or too broad to be worth
/// remembering. Pure positional wildcards, blank resource-id literals and
/// bare wildcards are all rejected.
pub fn is_generic(strategy: LocatorStrategy, value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() {
        return true;
    }
    if v == "*" || v == "//*" || v == "**" {
        return true;
    }
    match strategy {
        LocatorStrategy::Id => v.ends_with("id/") || v.ends_with(':') || v == "id=",
        LocatorStrategy::Path => PURE_POSITIONAL.is_match(v),
        _ => false,
    }
}

/// Screen-name aliases used to widen lookups: raw, package-qualified,
/// short name, package-qualified short name.
pub fn screen_aliases(app: &str, screen: &str) -> Vec<String> {
    if screen.is_empty() {
        return vec![NO_SCREEN.to_string()];
    }
    let short = screen
        .rsplit(|c| c == '.' || c == '/')
        .next()
        .unwrap_or(screen)
        .to_string();
    let mut aliases = vec![
        screen.to_string(),
        format!("{}/{}", app, screen),
        short.clone(),
        format!("{}/{}", app, short),
    ];
    aliases.sort();
    aliases.dedup();
    aliases
}

/// Persistent, scored cache of (app, screen, operation, hint) → locators.
/// Shared across runs; guarded internally for concurrent access; persisted
/// write-through after every mutation.
pub struct SelectorMemory {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, Vec<SelectorCandidate>>>,
}

impl SelectorMemory {
    /// Open the store under `dir`, loading any persisted state.
    pub fn open(dir: &Path) -> Result<Self, AgentError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("selector_memory.json");
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("⚠️ [Memory] store unreadable, starting fresh: {}", e);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        Ok(Self { path: Some(path), entries: Mutex::new(entries) })
    }

    /// Volatile store for tests.
    pub fn in_memory() -> Self {
        Self { path: None, entries: Mutex::new(HashMap::new()) }
    }

    fn key(app: &str, screen: &str, operation: Operation, hint: &str) -> String {
        let screen = if screen.is_empty() { NO_SCREEN } else { screen };
        format!("{}|{}|{}|{}", app, screen, operation.as_str(), hint.to_lowercase())
    }

    /// Remembered locators for the key, unioned across screen aliases and
    /// the no-screen bucket, best score first.
    pub fn lookup(&self, app: &str, screen: &str, operation: Operation, hint: &str) -> Vec<Locator> {
        let mut aliases = screen_aliases(app, screen);
        if !aliases.iter().any(|a| a == NO_SCREEN) {
            aliases.push(NO_SCREEN.to_string());
        }

        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };

        let mut best: HashMap<(LocatorStrategy, String), SelectorCandidate> = HashMap::new();
        for alias in &aliases {
            let key = Self::key(app, alias, operation, hint);
            for cand in entries.get(&key).into_iter().flatten() {
                let slot = (cand.strategy, cand.value.clone());
                match best.get(&slot) {
                    Some(existing) if existing.score() >= cand.score() => {}
                    _ => {
                        best.insert(slot, cand.clone());
                    }
                }
            }
        }

        let mut ranked: Vec<SelectorCandidate> = best.into_values().collect();
        ranked.sort_by_key(|c| -c.score());
        ranked.iter().map(|c| c.to_locator()).collect()
    }

    /// Reinforce a locator that worked for this key.
    pub fn record_success(&self, app: &str, screen: &str, operation: Operation, hint: &str, locator: &Locator) {
        if is_generic(locator.strategy, &locator.value) {
            debug!("🧹 [Memory] generic locator not persisted: {}", locator.value);
            return;
        }
        self.mutate(app, screen, operation, hint, locator, true);
    }

    /// Record a failure; decayed candidates are pruned outright.
    pub fn record_failure(&self, app: &str, screen: &str, operation: Operation, hint: &str, locator: &Locator) {
        if is_generic(locator.strategy, &locator.value) {
            return;
        }
        self.mutate(app, screen, operation, hint, locator, false);
    }

    fn mutate(&self, app: &str, screen: &str, operation: Operation, hint: &str, locator: &Locator, success: bool) {
        let key = Self::key(app, screen, operation, hint);
        {
            let mut entries = match self.entries.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let list = entries.entry(key).or_default();
            match list.iter_mut().find(|c| c.matches(locator)) {
                Some(cand) => {
                    if success {
                        cand.successes += 1;
                    } else {
                        cand.failures += 1;
                    }
                    cand.last_seen = Utc::now();
                }
                None => list.push(SelectorCandidate {
                    strategy: locator.strategy,
                    value: locator.value.clone(),
                    successes: if success { 1 } else { 0 },
                    failures: if success { 0 } else { 1 },
                    last_seen: Utc::now(),
                }),
            }
            if !success {
                list.retain(|c| !(c.failures >= 3 && c.score() < 0));
            }
            list.sort_by_key(|c| -c.score());
            list.truncate(MAX_CANDIDATES);
        }
        self.save();
    }

    /// Write-through persistence. Last writer wins on the shared file.
    fn save(&self) {
        let Some(path) = &self.path else { return };
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match serde_json::to_string_pretty(&*entries) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    warn!("⚠️ [Memory] save failed: {}", e);
                }
            }
            Err(e) => warn!("⚠️ [Memory] serialize failed: {}", e),
        }
    }
}
