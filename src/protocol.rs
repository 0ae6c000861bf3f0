//! Wire protocol — typed client/server events for the realtime layer.
//!
//! DESIGN
//! ======
//! Every WebSocket text message is one JSON object tagged on an `event`
//! field. Inbound payloads deserialize into `ClientEvent` before any
//! handler runs, so the event router dispatches with an exhaustive match
//! instead of inspecting untyped maps. Anything that fails to parse is
//! rejected with `invalid-payload` and never partially applied.
//!
//! ERROR EVENTS
//! ============
//! Failures flow back to the sender only, as `error{reason, message}`.
//! `reason` is a short machine-readable code the client uses to decide
//! whether to retry (auth) or give up (authorization/validation).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::UserIdentity;

// =============================================================================
// INBOUND EVENTS
// =============================================================================

/// Client → server events. Wire field names mirror the NoteVault web
/// client (camelCase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    JoinWorkspace {
        workspace_id: Uuid,
    },
    LeaveWorkspace {
        workspace_id: Uuid,
    },
    CursorMove {
        workspace_id: Uuid,
        x: f64,
        y: f64,
    },
    /// Full-field note edit (title/content). Append an activity entry.
    NoteUpdated {
        workspace_id: Uuid,
        note_id: Uuid,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
    /// Geometry-only note edit from dragging/resizing. High frequency;
    /// persists position/size but never writes the activity log.
    NoteMoved {
        workspace_id: Uuid,
        note_id: Uuid,
        x: f64,
        y: f64,
        #[serde(default)]
        width: Option<f64>,
        #[serde(default)]
        height: Option<f64>,
    },
    /// The REST path already persisted the note; this only propagates it.
    NoteCreated {
        workspace_id: Uuid,
        note: serde_json::Value,
    },
    ConnectionCreated {
        workspace_id: Uuid,
        from_id: Uuid,
        to_id: Uuid,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        style: Option<String>,
    },
    ConnectionUpdated {
        workspace_id: Uuid,
        connection_id: Uuid,
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        style: Option<String>,
    },
    ConnectionDeleted {
        workspace_id: Uuid,
        connection_id: Uuid,
    },
    /// `workspace_id` absent targets the public chat room.
    ChatMessage {
        #[serde(default)]
        workspace_id: Option<Uuid>,
        content: String,
    },
    TypingStart {
        #[serde(default)]
        workspace_id: Option<Uuid>,
    },
    TypingStop {
        #[serde(default)]
        workspace_id: Option<Uuid>,
    },
}

// =============================================================================
// OUTBOUND EVENTS
// =============================================================================

/// Server → client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        user: UserIdentity,
    },
    AuthenticationFailed,
    /// Roster returned to a joining client; peers get `user-joined` instead.
    WorkspaceUsers {
        users: Vec<UserIdentity>,
    },
    UserJoined {
        user: UserIdentity,
    },
    UserLeft {
        user: UserIdentity,
    },
    CursorUpdate {
        user_id: Uuid,
        name: String,
        x: f64,
        y: f64,
        color: String,
    },
    /// Emitted when a user leaves a room so peers drop the stale cursor
    /// immediately instead of inferring it from `user-left`.
    CursorRemove {
        user_id: Uuid,
    },
    NoteUpdated {
        workspace_id: Uuid,
        note_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        user_id: Uuid,
    },
    NoteMoved {
        workspace_id: Uuid,
        note_id: Uuid,
        x: f64,
        y: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        width: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        height: Option<f64>,
        user_id: Uuid,
    },
    NoteCreated {
        workspace_id: Uuid,
        note: serde_json::Value,
        user_id: Uuid,
    },
    ConnectionCreated {
        workspace_id: Uuid,
        from_id: Uuid,
        to_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        style: Option<String>,
        user_id: Uuid,
    },
    ConnectionUpdated {
        workspace_id: Uuid,
        connection_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        style: Option<String>,
        user_id: Uuid,
    },
    ConnectionDeleted {
        workspace_id: Uuid,
        connection_id: Uuid,
        user_id: Uuid,
    },
    /// Carries the durable id assigned by the store; persisted before any
    /// client sees it, so receivers can dedupe/order by id.
    ChatMessage {
        id: Uuid,
        content: String,
        user: UserIdentity,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        workspace_id: Option<Uuid>,
    },
    UserTyping {
        user_id: Uuid,
        name: String,
        is_typing: bool,
    },
    Error {
        reason: ErrorReason,
        message: String,
    },
}

// =============================================================================
// ERROR REASONS
// =============================================================================

/// Machine-readable reason codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorReason {
    Unauthenticated,
    AccessDenied,
    InvalidPayload,
    PersistenceFailed,
}

/// Conversion from typed handler errors into targeted `error` events.
pub trait IntoErrorEvent: std::fmt::Display {
    fn reason(&self) -> ErrorReason;

    fn error_event(&self) -> ServerEvent {
        ServerEvent::Error { reason: self.reason(), message: self.to_string() }
    }
}

// =============================================================================
// CURSOR COLOR
// =============================================================================

/// Deterministic presence color for a user. Hashing the id means the same
/// user renders the same color on every client with no coordination.
#[must_use]
pub fn user_color(user_id: Uuid) -> String {
    let hash = user_id
        .as_bytes()
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(*b)));
    let hue = hash % 360;
    format!("hsl({hue}, 70%, 50%)")
}

// =============================================================================
// TESTS
// =============================================================================
