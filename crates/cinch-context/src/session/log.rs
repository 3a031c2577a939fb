//! Arena-backed session log with JSONL persistence.
//!
//! Entries live in a `Vec` in append order with an id → index map, so
//! branch walking follows parent indices instead of pointers. On disk the
//! log is one JSON entry per line; the leaf is the last entry appended
//! unless the file is re-opened and the caller moves it.

use super::{BranchSummaryEntry, CompactionDetails, CompactionEntry, Entry, EntryKind, EntryStore};
use crate::AgentMessage;
use crate::error::StoreError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;

/// Generate a short unique entry id.
pub fn generate_entry_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    // Low 32 bits of the clock keep ids short; the counter keeps them unique.
    format!("{:08x}{count:04x}", (ts & 0xffff_ffff) as u64)
}

/// In-memory session tree.
#[derive(Debug, Default, Clone)]
pub struct SessionLog {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    leaf: Option<usize>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all branches.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in append order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Insert a fully formed entry and make it the leaf.
    ///
    /// The parent must already be present; ids must be unique.
    pub fn insert(&mut self, entry: Entry) -> Result<String, StoreError> {
        if self.index.contains_key(&entry.id) {
            return Err(StoreError::DuplicateId(entry.id));
        }
        if let Some(parent) = &entry.parent_id
            && !self.index.contains_key(parent)
        {
            return Err(StoreError::UnknownParent {
                id: entry.id,
                parent: parent.clone(),
            });
        }
        let id = entry.id.clone();
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(entry);
        self.leaf = Some(self.entries.len() - 1);
        Ok(id)
    }

    /// Append an entry of the given kind under the current leaf.
    pub fn append(&mut self, kind: EntryKind) -> Result<String, StoreError> {
        let parent = self.current_leaf_id();
        let id = self.fresh_id(generate_entry_id);
        self.insert(Entry::new(id, parent, kind))
    }

    /// First generated id not already in the log.
    ///
    /// Ids from another process writing the same file can collide with
    /// ours; those are skipped.
    fn fresh_id(&self, mut generate: impl FnMut() -> String) -> String {
        loop {
            let id = generate();
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }

    /// Append a conversation record under the current leaf.
    pub fn append_message(&mut self, message: AgentMessage) -> Result<String, StoreError> {
        self.append(EntryKind::Message { message })
    }

    /// Parent chain of `start`, walking toward the root (leaf first).
    fn path_indices(&self, start: Option<usize>) -> Vec<usize> {
        let mut path = Vec::new();
        let mut cursor = start;
        while let Some(idx) = cursor {
            path.push(idx);
            cursor = self.entries[idx]
                .parent_id
                .as_deref()
                .and_then(|p| self.index.get(p).copied());
        }
        path
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Load a JSONL session file. Blank lines are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_jsonl(&contents)
    }

    pub fn from_jsonl(contents: &str) -> Result<Self, StoreError> {
        let mut log = Self::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: Entry = serde_json::from_str(line)
                .map_err(|source| StoreError::Parse { line: n + 1, source })?;
            log.insert(entry)?;
        }
        debug!("Loaded session log: {} entries", log.len());
        Ok(log)
    }

    pub fn to_jsonl(&self) -> Result<String, StoreError> {
        let mut out = String::new();
        for entry in &self.entries {
            let line = serde_json::to_string(entry).map_err(StoreError::Serialize)?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "session.jsonl".into());
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

        let written = std::fs::write(&tmp_path, self.to_jsonl()?)
            .and_then(|()| std::fs::rename(&tmp_path, path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        debug!("Saved session log to {}", path.display());
        Ok(())
    }
}

impl EntryStore for SessionLog {
    fn branch_entries(&self, leaf_id: Option<&str>) -> Vec<Entry> {
        let start = match leaf_id {
            Some(id) => match self.index.get(id) {
                Some(&idx) => Some(idx),
                None => return Vec::new(),
            },
            None => self.leaf,
        };
        let mut path = self.path_indices(start);
        path.reverse();
        path.into_iter().map(|i| self.entries[i].clone()).collect()
    }

    fn entry(&self, id: &str) -> Option<&Entry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    fn current_leaf_id(&self) -> Option<String> {
        self.leaf.map(|i| self.entries[i].id.clone())
    }

    fn set_leaf(&mut self, leaf_id: Option<&str>) -> Result<(), StoreError> {
        self.leaf = match leaf_id {
            Some(id) => Some(
                *self
                    .index
                    .get(id)
                    .ok_or_else(|| StoreError::UnknownEntry(id.to_string()))?,
            ),
            None => None,
        };
        Ok(())
    }

    fn append_compaction(
        &mut self,
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
        details: Option<CompactionDetails>,
        from_hook: bool,
    ) -> Result<String, StoreError> {
        if !self.index.contains_key(&first_kept_entry_id) {
            return Err(StoreError::UnknownEntry(first_kept_entry_id));
        }
        self.append(EntryKind::Compaction(CompactionEntry {
            summary,
            first_kept_entry_id,
            tokens_before,
            details,
            from_hook,
        }))
    }

    fn append_branch_summary(
        &mut self,
        new_leaf_parent: Option<&str>,
        from_id: String,
        summary: String,
        details: Option<CompactionDetails>,
        from_hook: bool,
    ) -> Result<String, StoreError> {
        self.set_leaf(new_leaf_parent)?;
        self.append(EntryKind::BranchSummary(BranchSummaryEntry {
            from_id,
            summary,
            details,
            from_hook,
        }))
    }
}
