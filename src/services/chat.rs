//! Chat pipeline — persist first, then fan out.
//!
//! ORDERING INVARIANT
//! ==================
//! A message must have a durable id before any client sees it, so clients
//! can dedupe and order by id. If the insert fails, zero broadcasts occur
//! and only the sender hears about it.

use tracing::info;
use uuid::Uuid;

use crate::protocol::{ErrorReason, IntoErrorEvent, ServerEvent};
use crate::services::{access, rooms};
use crate::state::AppState;
use crate::store::{StoreError, UserIdentity};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message content required")]
    EmptyMessage,
    #[error("no access to workspace chat {0}")]
    AccessDenied(Uuid),
    #[error("failed to persist message: {0}")]
    Store(#[from] StoreError),
}

impl IntoErrorEvent for ChatError {
    fn reason(&self) -> ErrorReason {
        match self {
            Self::EmptyMessage => ErrorReason::InvalidPayload,
            Self::AccessDenied(_) => ErrorReason::AccessDenied,
            Self::Store(_) => ErrorReason::PersistenceFailed,
        }
    }
}

/// Persist a chat message and broadcast it to the target room, sender
/// included — the sender renders its own message through the same code
/// path as everyone else's.
///
/// `workspace_id: None` targets the public room, which any authenticated
/// connection may use; a workspace target additionally requires view
/// access.
///
/// # Errors
///
/// `EmptyMessage` for whitespace-only content, `AccessDenied` for a
/// workspace the user cannot view, or a store error if persistence fails
/// (in which case nothing is broadcast).
pub async fn send_message(
    state: &AppState,
    user: &UserIdentity,
    workspace_id: Option<Uuid>,
    content: &str,
) -> Result<(), ChatError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::EmptyMessage);
    }

    if let Some(id) = workspace_id {
        if !access::can_view(state.store.as_ref(), user.id, id).await? {
            return Err(ChatError::AccessDenied(id));
        }
    }

    // Durable id first; broadcast only after the insert succeeded.
    let persisted = state.store.create_chat_message(content, user.id).await?;
    info!(message_id = %persisted.id, user_id = %user.id, workspace = ?workspace_id, "chat message persisted");

    let event = ServerEvent::ChatMessage {
        id: persisted.id,
        content: content.to_string(),
        user: user.clone(),
        timestamp: persisted.created_at,
        workspace_id,
    };
    rooms::broadcast_target(state, workspace_id, &event, None).await;

    Ok(())
}

/// Broadcast a typing indicator to the target room, excluding the sender.
/// Stop is not paired with start; receivers tolerate a stop on its own.
///
/// # Errors
///
/// `AccessDenied` for a workspace the user cannot view, or a store error
/// if the access lookup fails.
pub async fn set_typing(
    state: &AppState,
    sender_conn: Uuid,
    user: &UserIdentity,
    workspace_id: Option<Uuid>,
    is_typing: bool,
) -> Result<(), ChatError> {
    if let Some(id) = workspace_id {
        if !access::can_view(state.store.as_ref(), user.id, id).await? {
            return Err(ChatError::AccessDenied(id));
        }
    }

    let event = ServerEvent::UserTyping { user_id: user.id, name: user.name.clone(), is_typing };
    rooms::broadcast_target(state, workspace_id, &event, Some(sender_conn)).await;
    Ok(())
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
