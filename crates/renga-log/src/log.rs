//! Per-category append-only command log with cursor-based diffing.
//!
//! Each category keeps its commands in arrival order plus a `sent` cursor: how
//! many entries have already gone out. The cursor is a *count*, never a set of
//! identities, so commands merged in from peers and commands created locally
//! both move it the same way.
//!
//! ```text
//!   commands: [c0 c1 c2 c3 c4 c5]
//!                      ▲        ▲
//!                    sent      len
//!   new_commands_since() → [c3 c4 c5], sent = len
//! ```
//!
//! Invariant: `sent <= len` for every category, always.

use indexmap::IndexMap;
use renga_types::{Category, Command, CommandId};
use tracing::{debug, trace, warn};

/// One category's commands and its outward cursor.
#[derive(Debug, Clone, Default)]
pub struct CategoryLog {
    commands: Vec<Command>,
    sent: usize,
}

impl CategoryLog {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// How many entries have been transmitted outward.
    pub fn sent_count(&self) -> usize {
        self.sent
    }

    /// Entries appended since the last diff.
    pub fn pending_count(&self) -> usize {
        self.commands.len() - self.sent
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

/// The full command log: every category's [`CategoryLog`], in a stable order.
///
/// Categories are created on first use; appends never fail.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    categories: IndexMap<Category, CategoryLog>,
}

impl CommandLog {
    /// Create a log with the given categories pre-registered (in that order).
    pub fn new(categories: impl IntoIterator<Item = Category>) -> Self {
        let mut log = Self::default();
        for category in categories {
            log.categories.entry(category).or_default();
        }
        log
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    /// Registered categories in replication order.
    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.keys()
    }

    pub fn category(&self, category: &str) -> Option<&CategoryLog> {
        self.categories.get(category)
    }

    /// Commands of one category (empty if the category is unknown).
    pub fn commands(&self, category: &str) -> &[Command] {
        self.categories
            .get(category)
            .map(|log| log.commands.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `category` holds a command with this id.
    pub fn contains(&self, category: &str, id: &CommandId) -> bool {
        self.commands(category).iter().any(|c| c.command_id == *id)
    }

    /// Total commands across all categories.
    pub fn total_len(&self) -> usize {
        self.categories.values().map(CategoryLog::len).sum()
    }

    /// Total entries not yet transmitted.
    pub fn total_pending(&self) -> usize {
        self.categories.values().map(CategoryLog::pending_count).sum()
    }

    /// Append one command. Pure in-memory; cannot fail.
    pub fn append(&mut self, category: &Category, command: Command) {
        let log = self.categories.entry(category.clone()).or_default();
        trace!(
            category = %category,
            command_id = %command.command_id,
            kind = %command.kind,
            len = log.commands.len() + 1,
            "append"
        );
        log.commands.push(command);
    }

    /// Append commands that arrived from a peer.
    ///
    /// If nothing local was waiting to go out, the cursor moves past the new
    /// entries: every other peer got the same broadcast, so relaying it would
    /// only echo. If local entries are pending, the received ones ride along
    /// with the next diff; receivers drop them as duplicates.
    pub fn absorb(&mut self, category: &Category, commands: impl IntoIterator<Item = Command>) -> usize {
        let log = self.categories.entry(category.clone()).or_default();
        let caught_up = log.sent == log.commands.len();
        let before = log.commands.len();
        log.commands.extend(commands);
        let added = log.commands.len() - before;
        if caught_up {
            log.sent = log.commands.len();
        }
        trace!(category = %category, added, caught_up, "absorb");
        added
    }

    /// Return the suffix beyond the cursor and advance the cursor to the end.
    pub fn new_commands_since(&mut self, category: &str) -> Vec<Command> {
        let Some(log) = self.categories.get_mut(category) else {
            return Vec::new();
        };
        if log.sent > log.commands.len() {
            // Only reachable if someone truncated behind our back
            warn!(
                category,
                sent = log.sent,
                len = log.commands.len(),
                "cursor ahead of log, recomputing"
            );
            log.sent = log.commands.len();
        }
        let diff = log.commands[log.sent..].to_vec();
        log.sent = log.commands.len();
        diff
    }

    /// Diff every category at once; categories with nothing new are omitted.
    pub fn drain_new(&mut self) -> IndexMap<Category, Vec<Command>> {
        let categories: Vec<Category> = self.categories.keys().cloned().collect();
        let mut out = IndexMap::new();
        for category in categories {
            let diff = self.new_commands_since(category.as_str());
            if !diff.is_empty() {
                out.insert(category, diff);
            }
        }
        if !out.is_empty() {
            debug!(
                categories = out.len(),
                commands = out.values().map(Vec::len).sum::<usize>(),
                "computed outward diff"
            );
        }
        out
    }

    /// Move every cursor to the current end of its log.
    ///
    /// Used after a full resynchronization: the rebuilt log is what every
    /// peer already has, so none of it is "new".
    pub fn mark_all_sent(&mut self) {
        for log in self.categories.values_mut() {
            log.sent = log.commands.len();
        }
    }

    /// Remove every command but keep the registered categories.
    pub fn clear(&mut self) {
        for log in self.categories.values_mut() {
            log.commands.clear();
            log.sent = 0;
        }
    }

    /// Copy of the whole log keyed by category, in the persisted blob shape.
    pub fn snapshot(&self) -> IndexMap<Category, Vec<Command>> {
        self.categories
            .iter()
            .map(|(category, log)| (category.clone(), log.commands.clone()))
            .collect()
    }
}
