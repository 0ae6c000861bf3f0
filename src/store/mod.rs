//! Persistence collaborator contract.
//!
//! ARCHITECTURE
//! ============
//! The realtime layer owns no durable state. Everything durable — users,
//! workspaces, notes, chat, the activity log — belongs to the host
//! NoteVault application, reached through the `Store` trait. Handlers hold
//! an `Arc<dyn Store>` so tests can swap in an in-memory double without a
//! database.
//!
//! Callers must treat every method as slow (it hits Postgres) and never
//! hold an in-memory lock across a call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod pg;

pub use pg::PgStore;

// =============================================================================
// TYPES
// =============================================================================

/// User identity attached to a connection at authenticate time and cached
/// for the connection's lifetime. Staleness after a role change is accepted;
/// the cache avoids a lookup per event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    /// Application-level role (e.g. `"ADMIN"`, `"USER"`), distinct from
    /// per-workspace membership roles.
    pub role: String,
}

/// Per-workspace membership role. `Viewer` is the read-only tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl MembershipRole {
    /// Parse a role column value. Unknown strings fail closed to `Viewer`.
    #[must_use]
    pub fn from_db(value: &str) -> Self {
        match value {
            "OWNER" => Self::Owner,
            "ADMIN" => Self::Admin,
            "MEMBER" => Self::Member,
            _ => Self::Viewer,
        }
    }

    #[must_use]
    pub fn can_edit(self) -> bool {
        !matches!(self, Self::Viewer)
    }
}

/// Membership row for a user in a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipRecord {
    pub role: MembershipRole,
}

/// Partial note update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

impl NotePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.x.is_none()
            && self.y.is_none()
            && self.width.is_none()
            && self.height.is_none()
    }
}

/// One entry for the workspace activity log.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub kind: String,
    pub title: String,
    pub description: String,
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub metadata: serde_json::Value,
}

/// A chat message after the store assigned its durable id and timestamp.
#[derive(Debug, Clone)]
pub struct PersistedMessage {
    pub id: Uuid,
    pub created_at: String,
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("note not found: {0}")]
    NoteNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// =============================================================================
// TRAIT
// =============================================================================

/// The contract this core consumes from the excluded persistence/auth
/// subsystem. Shapes follow the host schema; only the contract matters here.
#[async_trait]
pub trait Store: Send + Sync {
    /// Validate an opaque credential token and return the active user it
    /// belongs to, or `None` for a bad/expired token.
    async fn verify_credential(&self, token: &str) -> Result<Option<UserIdentity>, StoreError>;

    async fn workspace_owner(&self, workspace_id: Uuid) -> Result<Option<Uuid>, StoreError>;

    async fn workspace_membership(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<Option<MembershipRecord>, StoreError>;

    async fn is_workspace_public(&self, workspace_id: Uuid) -> Result<bool, StoreError>;

    /// Apply a partial update to a note row. The caller must have already
    /// checked edit access.
    async fn update_note(&self, note_id: Uuid, patch: NotePatch) -> Result<(), StoreError>;

    async fn create_activity(&self, entry: ActivityEntry) -> Result<(), StoreError>;

    /// Insert a chat message and return its durable id/timestamp. Must
    /// complete before the message is broadcast to anyone.
    async fn create_chat_message(
        &self,
        content: &str,
        author_id: Uuid,
    ) -> Result<PersistedMessage, StoreError>;

    /// Best-effort online flag; failures must not affect broadcasts.
    async fn set_user_online(&self, user_id: Uuid, online: bool) -> Result<(), StoreError>;
}

// =============================================================================
// TESTS
// =============================================================================
