//! Room Manager and Presence Broadcaster.
//!
//! DESIGN
//! ======
//! A room is the broadcast scope for one workspace. Membership lives in
//! `AppState::rooms`; the implicit public room is the connection registry
//! itself. Join runs the access check *before* taking the room lock and
//! the lock is released before any presence fan-out, so no lock is ever
//! held across store I/O or a channel send.
//!
//! LIFECYCLE
//! =========
//! Rooms are created lazily on first join and evicted as soon as the last
//! member leaves, so the table never grows across ephemeral workspaces.
//! Leave/cleanup is idempotent: a displaced or already-removed connection
//! produces no duplicate `user-left`.

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::protocol::{ErrorReason, IntoErrorEvent, ServerEvent};
use crate::services::access;
use crate::state::{AppState, RoomMember, RoomState};
use crate::store::{StoreError, UserIdentity};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("access denied to workspace {0}")]
    AccessDenied(Uuid),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoErrorEvent for RoomError {
    fn reason(&self) -> ErrorReason {
        match self {
            Self::AccessDenied(_) => ErrorReason::AccessDenied,
            Self::Store(_) => ErrorReason::PersistenceFailed,
        }
    }
}

// =============================================================================
// CONNECTION REGISTRY
// =============================================================================

/// Register an open connection. Public broadcasts reach it from this point
/// on, authenticated or not.
pub async fn register_conn(state: &AppState, conn_id: Uuid, tx: mpsc::Sender<ServerEvent>) {
    state.conns.write().await.insert(conn_id, tx);
}

pub async fn deregister_conn(state: &AppState, conn_id: Uuid) {
    state.conns.write().await.remove(&conn_id);
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Join a workspace room after a `can_view` check.
///
/// Returns the roster of users already present (self included) so the
/// caller can render presence; the other members get a `user-joined`
/// announcement. The joining client is excluded from that announcement —
/// it already has the roster.
///
/// If the same user has an older connection in the room, that connection
/// is displaced silently (last connection wins).
///
/// # Errors
///
/// `AccessDenied` if the user cannot view the workspace, or a store error
/// if the access lookup fails.
pub async fn join_workspace(
    state: &AppState,
    conn_id: Uuid,
    user: &UserIdentity,
    workspace_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
) -> Result<Vec<UserIdentity>, RoomError> {
    // Access check before the lock; never hold the lock across store I/O.
    if !access::can_view(state.store.as_ref(), user.id, workspace_id).await? {
        return Err(RoomError::AccessDenied(workspace_id));
    }

    let roster = {
        let mut rooms = state.rooms.write().await;
        let room = rooms.entry(workspace_id).or_insert_with(RoomState::new);

        if let Some(old_conn) = room.user_conns.insert(user.id, conn_id) {
            if old_conn != conn_id {
                room.members.remove(&old_conn);
                info!(%workspace_id, user_id = %user.id, "displaced older connection for user");
            }
        }
        room.members
            .insert(conn_id, RoomMember { user: user.clone(), tx });
        room.roster()
    };

    info!(%workspace_id, %conn_id, user_id = %user.id, members = roster.len(), "user joined workspace room");

    broadcast(state, workspace_id, &ServerEvent::UserJoined { user: user.clone() }, Some(conn_id)).await;

    Ok(roster)
}

/// Leave a workspace room (explicit leave or disconnect cleanup).
///
/// Announces `user-left` and `cursor-remove` to the remaining members and
/// evicts the room if it became empty. Safe to call twice: a connection that is no longer the
/// room's registered connection for its user announces nothing.
pub async fn leave_workspace(state: &AppState, conn_id: Uuid, workspace_id: Uuid) {
    let departed = {
        let mut rooms = state.rooms.write().await;
        let Some(room) = rooms.get_mut(&workspace_id) else {
            return;
        };
        let Some(member) = room.members.remove(&conn_id) else {
            return;
        };

        // Only clear the reverse index if this connection still owns it;
        // a displaced connection must not unregister its successor.
        let announce = room.user_conns.get(&member.user.id) == Some(&conn_id);
        if announce {
            room.user_conns.remove(&member.user.id);
        }

        if room.members.is_empty() {
            rooms.remove(&workspace_id);
            info!(%workspace_id, "evicted empty workspace room");
        }

        announce.then_some(member.user)
    };

    if let Some(user) = departed {
        info!(%workspace_id, %conn_id, user_id = %user.id, "user left workspace room");
        let user_id = user.id;
        broadcast(state, workspace_id, &ServerEvent::UserLeft { user }, Some(conn_id)).await;
        // Peers drop the departed cursor right away rather than waiting to
        // react to the presence change.
        broadcast(state, workspace_id, &ServerEvent::CursorRemove { user_id }, Some(conn_id)).await;
    }
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Broadcast an event to every member of a workspace room, optionally
/// excluding one connection. Best-effort: a member whose queue is full
/// drops the event rather than blocking the sender's stream.
pub async fn broadcast(state: &AppState, workspace_id: Uuid, event: &ServerEvent, exclude: Option<Uuid>) {
    let rooms = state.rooms.read().await;
    let Some(room) = rooms.get(&workspace_id) else {
        return;
    };

    for (conn_id, member) in &room.members {
        if exclude == Some(*conn_id) {
            continue;
        }
        let _ = member.tx.try_send(event.clone());
    }
}

/// Broadcast to the public room — every open connection, anonymous ones
/// included.
pub async fn broadcast_public(state: &AppState, event: &ServerEvent, exclude: Option<Uuid>) {
    let conns = state.conns.read().await;
    for (conn_id, tx) in conns.iter() {
        if exclude == Some(*conn_id) {
            continue;
        }
        let _ = tx.try_send(event.clone());
    }
}

/// Fan out to a workspace room when `workspace_id` is present, otherwise
/// to the public room.
pub async fn broadcast_target(
    state: &AppState,
    workspace_id: Option<Uuid>,
    event: &ServerEvent,
    exclude: Option<Uuid>,
) {
    match workspace_id {
        Some(id) => broadcast(state, id, event, exclude).await,
        None => broadcast_public(state, event, exclude).await,
    }
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
