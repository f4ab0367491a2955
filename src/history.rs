//! Command history for tterm
//!
//! Stored in `~/.tterm/history`, one command or connection string per line.
//! Lines starting with `~` are UI preferences (`~key=value`); they are kept
//! verbatim and never count as history. Unreadable or odd content is
//! tolerated: whatever can't be understood is carried through unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::data_dir;

/// Maximum number of history entries
const HISTORY_LIMIT: usize = 1000;

/// Command history and preference storage
#[derive(Debug, Default)]
pub struct CommandHistory {
    /// Newest last
    entries: Vec<String>,
    /// Raw `~` lines, in file order
    prefs: Vec<String>,
    file_path: Option<PathBuf>,
}

impl CommandHistory {
    /// Load `~/.tterm/history`
    pub fn new() -> Self {
        match data_dir() {
            Some(dir) => Self::open(&dir.join("history")),
            None => Self::default(),
        }
    }

    /// Load from a specific file; a missing file is an empty history
    pub fn open(path: &Path) -> Self {
        let mut history = Self {
            file_path: Some(path.to_path_buf()),
            ..Self::default()
        };
        if let Ok(bytes) = fs::read(path) {
            for line in String::from_utf8_lossy(&bytes).lines() {
                let line = line.trim_end_matches('\r');
                if line.starts_with('~') {
                    history.prefs.push(line.to_string());
                } else if !line.trim().is_empty() {
                    history.entries.push(line.to_string());
                }
            }
        }
        let excess = history.entries.len().saturating_sub(HISTORY_LIMIT);
        history.entries.drain(..excess);
        history
    }

    fn save(&self) {
        let Some(path) = &self.file_path else {
            return;
        };
        let mut content = String::new();
        for line in self.prefs.iter().chain(self.entries.iter()) {
            content.push_str(line);
            content.push('\n');
        }
        if let Err(e) = fs::write(path, content) {
            warn!("could not save history to {}: {}", path.display(), e);
        }
    }

    /// Add a command; blank lines and repeats of the last entry are skipped
    pub fn add(&mut self, command: &str) {
        let trimmed = command.trim();
        if trimmed.is_empty() || trimmed.starts_with('~') {
            return;
        }
        let entry = redact(trimmed);
        if self.entries.last() == Some(&entry) {
            return;
        }
        self.entries.push(entry);
        let excess = self.entries.len().saturating_sub(HISTORY_LIMIT);
        self.entries.drain(..excess);
        self.save();
    }

    /// Entries containing `query`, newest first
    pub fn search(&self, query: &str) -> Vec<&str> {
        let query = query.to_lowercase();
        self.entries
            .iter()
            .rev()
            .filter(|e| e.to_lowercase().contains(&query))
            .map(String::as_str)
            .collect()
    }

    /// Newest first
    pub fn recent(&self, count: usize) -> Vec<&str> {
        self.entries.iter().rev().take(count).map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of a `~key=value` preference
    pub fn pref(&self, key: &str) -> Option<&str> {
        self.prefs.iter().rev().find_map(|line| {
            let (k, v) = line[1..].split_once('=')?;
            (k.trim() == key).then(|| v.trim())
        })
    }

    /// Set a preference, replacing an existing line for the same key
    pub fn set_pref(&mut self, key: &str, value: &str) {
        let line = format!("~{}={}", key, value);
        let existing = self
            .prefs
            .iter()
            .position(|l| l[1..].split_once('=').map_or(false, |(k, _)| k.trim() == key));
        match existing {
            Some(i) => self.prefs[i] = line,
            None => self.prefs.push(line),
        }
        self.save();
    }
}

/// Drop an inline password from connection strings: `ssh user:pw@host`
/// is remembered as `ssh user@host`
fn redact(command: &str) -> String {
    let mut words = command.splitn(2, ' ');
    let (first, rest) = (words.next().unwrap_or(""), words.next());
    let redact_target = |target: &str| match target.rsplit_once('@') {
        Some((cred, host)) => match cred.split_once(':') {
            Some((user, _)) => format!("{}@{}", user, host),
            None => target.to_string(),
        },
        None => target.to_string(),
    };
    match (first.to_ascii_lowercase().as_str(), rest) {
        ("ssh" | "sftp" | "netconf", Some(target)) if !target.contains(' ') => {
            format!("{} {}", first, redact_target(target))
        }
        (_, None) if first.contains('@') => redact_target(first),
        _ => command.to_string(),
    }
}
