use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The four levels of the token hierarchy plus the single-purpose tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Auth,
    Session,
    Project,
    Verification,
    Reset,
}

impl TokenKind {
    /// Cache key prefix for the main record.
    pub fn prefix(&self) -> &'static str {
        match self {
            TokenKind::Auth => "auth_token",
            TokenKind::Session => "session_token",
            TokenKind::Project => "project_token",
            TokenKind::Verification => "verify_token",
            TokenKind::Reset => "reset_token",
        }
    }

    pub fn key(&self, token: &Uuid) -> String {
        format!("{}:{}", self.prefix(), token)
    }

    /// Hook keys expire shortly before the main record so cascades run while
    /// the record is still readable. Project tokens carry no TTL of their own
    /// (their lifetime is bounded by their parent set), and one-shot tokens
    /// need no cascade.
    pub fn has_hook(&self) -> bool {
        matches!(self, TokenKind::Auth | TokenKind::Session)
    }

    pub fn hook_key(&self, token: &Uuid) -> String {
        format!("{}_hook:{}", self.prefix(), token)
    }

    pub fn from_hook_key(key: &str) -> Option<(TokenKind, Uuid)> {
        let (prefix, token) = key.split_once(':')?;
        let kind = match prefix {
            "auth_token_hook" => TokenKind::Auth,
            "session_token_hook" => TokenKind::Session,
            _ => return None,
        };
        Uuid::parse_str(token).ok().map(|t| (kind, t))
    }
}

/// Per-user preference snapshot copied onto the session record at login so
/// the hot path never reads the durable store. The storage flags gate what
/// the persistence workers are allowed to write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPreferences {
    #[serde(default = "default_true")]
    pub store_context: bool,
    #[serde(default = "default_true")]
    pub store_contextual_telemetry: bool,
    #[serde(default = "default_true")]
    pub store_behavioral_telemetry: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        UserPreferences {
            store_context: true,
            store_contextual_telemetry: true,
            store_behavioral_telemetry: true,
        }
    }
}

/// Root identity credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRecord {
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
}

/// One browser/plugin session bound to an auth token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub auth_token: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub project_tokens: Vec<Uuid>,
    #[serde(default)]
    pub preferences: UserPreferences,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextChangeType {
    Update,
    Insert,
    Remove,
}

/// One edit against a single file of the project context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextChange {
    pub change_type: ContextChangeType,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub new_lines: Vec<String>,
}

/// Change-log entry, totally ordered per project by `index`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextChangeEntry {
    pub index: u64,
    pub file_path: String,
    pub change: ContextChange,
}

/// Project scope shared across sessions. The parent set and the context both
/// live inside the cache record; mutation happens under optimistic
/// concurrency (compare-and-swap of the whole record).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRecord {
    pub project_id: Uuid,
    pub owner_user_id: Uuid,
    #[serde(default)]
    pub session_tokens: Vec<Uuid>,
    /// file path -> current content.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Bounded tail of the change log; entries below `base_index` have been
    /// compacted into `context`.
    #[serde(default)]
    pub changes: Vec<ContextChangeEntry>,
    #[serde(default)]
    pub base_index: u64,
    #[serde(default)]
    pub next_index: u64,
}

impl ProjectRecord {
    pub fn new(project_id: Uuid, owner_user_id: Uuid, session_token: Uuid) -> Self {
        ProjectRecord {
            project_id,
            owner_user_id,
            session_tokens: vec![session_token],
            context: BTreeMap::new(),
            changes: Vec::new(),
            base_index: 0,
            next_index: 0,
        }
    }

    /// Applies one change: rewrites the addressed file in the context map,
    /// appends to the change log, and returns the assigned index. The caller
    /// is responsible for writing the record back under CAS.
    pub fn apply_change(
        &mut self,
        file_path: &str,
        change: ContextChange,
        changelog_cap: usize,
    ) -> u64 {
        let content = self.context.remove(file_path).unwrap_or_default();
        let mut lines: Vec<String> = if content.is_empty() {
            Vec::new()
        } else {
            content.lines().map(str::to_string).collect()
        };

        let start = (change.start_line as usize).min(lines.len());
        let end = (change.end_line as usize).min(lines.len()).max(start);

        match change.change_type {
            ContextChangeType::Update => {
                lines.splice(start..end, change.new_lines.iter().cloned());
            }
            ContextChangeType::Insert => {
                lines.splice(start..start, change.new_lines.iter().cloned());
            }
            ContextChangeType::Remove => {
                lines.drain(start..end);
            }
        }

        if !lines.is_empty() {
            self.context.insert(file_path.to_string(), lines.join("\n"));
        }

        let index = self.next_index;
        self.next_index += 1;
        self.changes.push(ContextChangeEntry {
            index,
            file_path: file_path.to_string(),
            change,
        });

        // Older entries are already reflected in `context`; compaction only
        // truncates the log tail we keep for late readers.
        if self.changes.len() > changelog_cap {
            let excess = self.changes.len() - changelog_cap;
            self.changes.drain(0..excess);
            self.base_index = self.changes.first().map(|c| c.index).unwrap_or(self.next_index);
        }

        index
    }

    /// Current context snapshot. The map reflects every change up to
    /// `next_index - 1`; callers referencing older indices receive the
    /// current map, which is always a superset of what they observed.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.context.clone()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.next_index.checked_sub(1)
    }
}

/// Single-purpose token (email verification / password reset). Consumed at
/// most once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OneShotRecord {
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}
