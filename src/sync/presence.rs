//! Peer identity and cursor presence.
//!
//! Cursor positions are presentation-only: remote cursors are stored as
//! received and never transformed, so they may be briefly stale until the
//! peer's next move. The local cursor is kept anchored to its character as
//! operations shift the text underneath it.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::operation::{OperationKind, TextOperation};
use super::UserId;

/// Palette used for cursors and attribution coloring
const USER_COLORS: [&str; 14] = [
    "#3b82f6", // blue
    "#ef4444", // red
    "#22c55e", // green
    "#f59e0b", // amber
    "#8b5cf6", // violet
    "#ec4899", // pink
    "#06b6d4", // cyan
    "#f97316", // orange
    "#14b8a6", // teal
    "#a855f7", // purple
    "#84cc16", // lime
    "#6366f1", // indigo
    "#d946ef", // fuchsia
    "#0ea5e9", // sky
];

const NAME_ADJECTIVES: [&str; 8] = [
    "Swift", "Brilliant", "Creative", "Bold", "Clever", "Keen", "Wise", "Quick",
];

const NAME_NOUNS: [&str; 8] = [
    "Writer", "Editor", "Author", "Scribe", "Poet", "Wordsmith", "Thinker", "Creator",
];

/// Caret position with an optional selection end, in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorState {
    pub position: usize,
    pub selection_end: Option<usize>,
}

impl CursorState {
    pub fn at(position: usize) -> Self {
        Self {
            position,
            selection_end: None,
        }
    }

    pub fn with_selection(mut self, end: usize) -> Self {
        self.selection_end = Some(end);
        self
    }

    /// A selection exists when its end differs from the caret
    pub fn has_selection(&self) -> bool {
        self.selection_end.is_some_and(|end| end != self.position)
    }

    /// Ordered `(start, end)` of the selection, if any
    pub fn selection_range(&self) -> Option<(usize, usize)> {
        if !self.has_selection() {
            return None;
        }
        self.selection_end
            .map(|end| (self.position.min(end), self.position.max(end)))
    }

    /// Keep the caret on the same logical character after `op` is applied
    pub fn adjust_for(&mut self, op: &TextOperation) {
        self.position = adjust_offset(self.position, op);
        self.selection_end = self.selection_end.map(|end| adjust_offset(end, op));
    }
}

fn adjust_offset(offset: usize, op: &TextOperation) -> usize {
    match op.kind {
        OperationKind::Insert { .. } => {
            if offset >= op.position {
                offset + op.length
            } else {
                offset
            }
        }
        OperationKind::Delete { .. } => {
            if offset > op.end() {
                offset - op.length
            } else if offset > op.position {
                op.position
            } else {
                offset
            }
        }
    }
}

/// A collaborator as announced by `user-join`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: UserId,
    pub name: String,
    pub color: String,
    pub online: bool,
    /// Unix milliseconds when the join was seen
    pub joined_at: i64,
}

impl UserInfo {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            color: color.into(),
            online: true,
            joined_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Remote users and their cursors
#[derive(Debug, Default)]
pub struct PresenceRoster {
    users: HashMap<UserId, UserInfo>,
    cursors: HashMap<UserId, CursorState>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a user. Returns true when the user is new.
    pub fn add_user(&mut self, info: UserInfo) -> bool {
        self.users.insert(info.user_id.clone(), info).is_none()
    }

    /// Forget a user and their cursor
    pub fn remove_user(&mut self, user_id: &str) -> Option<UserInfo> {
        self.cursors.remove(user_id);
        self.users.remove(user_id)
    }

    pub fn update_cursor(&mut self, user_id: &str, cursor: CursorState) {
        self.cursors.insert(user_id.to_string(), cursor);
    }

    pub fn user(&self, user_id: &str) -> Option<&UserInfo> {
        self.users.get(user_id)
    }

    pub fn cursor(&self, user_id: &str) -> Option<CursorState> {
        self.cursors.get(user_id).copied()
    }

    pub fn users(&self) -> impl Iterator<Item = &UserInfo> {
        self.users.values()
    }

    pub fn cursors(&self) -> impl Iterator<Item = (&str, CursorState)> {
        self.cursors.iter().map(|(id, c)| (id.as_str(), *c))
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.cursors.clear();
    }
}

/// Stable color for a user: every peer derives the same one from the id
pub fn color_for_user(user_id: &str) -> &'static str {
    let hash = user_id
        .chars()
        .fold(0i32, |hash, c| (hash << 5).wrapping_sub(hash).wrapping_add(c as i32));
    USER_COLORS[hash.unsigned_abs() as usize % USER_COLORS.len()]
}

/// Friendly random display name such as "Swift Writer"
pub fn generate_user_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = NAME_ADJECTIVES.choose(&mut rng).copied().unwrap_or("Anonymous");
    let noun = NAME_NOUNS.choose(&mut rng).copied().unwrap_or("Writer");
    format!("{} {}", adjective, noun)
}
