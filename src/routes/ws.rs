//! WebSocket handler — connection lifecycle and the event router.
//!
//! DESIGN
//! ======
//! On upgrade, each connection gets an id, an outbound mpsc channel, and a
//! `select!` loop:
//! - Inbound text frames → parse into `ClientEvent` → exhaustive dispatch
//! - Broadcast events from room peers → forward to the client
//!
//! Handlers validate, persist through the store, and fan out; every
//! failure becomes a targeted `error` event to the sender. Nothing throws
//! past the dispatch boundary, and no failure ever broadcasts.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register in the connection registry (public room)
//! 2. `authenticate` attaches a cached identity to the connection
//! 3. `join-workspace` enters a room after the access check
//! 4. Close → idempotent cleanup: leave room (announces `user-left`),
//!    deregister, best-effort offline flag

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ClientEvent, ErrorReason, IntoErrorEvent, ServerEvent, user_color};
use crate::services::{access, chat, rooms};
use crate::state::AppState;
use crate::store::{ActivityEntry, NotePatch, StoreError, UserIdentity};

/// Outbound queue depth per connection. Cursor floods beyond this are
/// dropped for that client (keep-latest is fine for ephemeral state).
const OUTBOUND_QUEUE: usize = 256;

// =============================================================================
// CONNECTION CONTEXT
// =============================================================================

/// Mutable per-connection state owned by the connection's task.
pub(crate) struct ConnCtx {
    pub conn_id: Uuid,
    /// Set exactly once, by a successful `authenticate`.
    pub user: Option<UserIdentity>,
    /// The one workspace room this connection is in, if any.
    pub workspace: Option<Uuid>,
    pub tx: mpsc::Sender<ServerEvent>,
}

impl ConnCtx {
    fn new(conn_id: Uuid, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { conn_id, user: None, workspace: None, tx }
    }
}

// =============================================================================
// EVENT ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum EventError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("access denied to workspace {0}")]
    AccessDenied(Uuid),
    #[error("join the workspace before sending events to it")]
    NotInRoom,
    #[error("{0}")]
    InvalidPayload(String),
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl IntoErrorEvent for EventError {
    fn reason(&self) -> ErrorReason {
        match self {
            Self::Unauthenticated => ErrorReason::Unauthenticated,
            Self::AccessDenied(_) | Self::NotInRoom => ErrorReason::AccessDenied,
            Self::InvalidPayload(_) => ErrorReason::InvalidPayload,
            Self::Store(_) => ErrorReason::PersistenceFailed,
        }
    }
}

impl From<rooms::RoomError> for EventError {
    fn from(err: rooms::RoomError) -> Self {
        match err {
            rooms::RoomError::AccessDenied(id) => Self::AccessDenied(id),
            rooms::RoomError::Store(e) => Self::Store(e),
        }
    }
}

impl From<chat::ChatError> for EventError {
    fn from(err: chat::ChatError) -> Self {
        match err {
            chat::ChatError::EmptyMessage => Self::InvalidPayload("message content required".into()),
            chat::ChatError::AccessDenied(id) => Self::AccessDenied(id),
            chat::ChatError::Store(e) => Self::Store(e),
        }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION LOOP
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE);
    let mut ctx = ConnCtx::new(conn_id, tx.clone());

    rooms::register_conn(&state, conn_id, tx).await;
    info!(%conn_id, "ws: connection opened");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_text(&state, &mut ctx, &text).await;
                        for event in replies {
                            if send_event(&mut socket, &event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    cleanup_connection(&state, &ctx).await;
    info!(%conn_id, "ws: connection closed");
}

/// Tear down a connection: leave its workspace room (announcing
/// `user-left`), deregister from the public room, and flip the durable
/// online flag off. Safe to run twice.
pub(crate) async fn cleanup_connection(state: &AppState, ctx: &ConnCtx) {
    if let Some(workspace_id) = ctx.workspace {
        rooms::leave_workspace(state, ctx.conn_id, workspace_id).await;
    }
    rooms::deregister_conn(state, ctx.conn_id).await;

    if let Some(user) = &ctx.user {
        set_online_fire_and_forget(state, user.id, false);
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize event");
            return Err(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse one inbound text frame and process it, returning the events owed
/// to the sender. Broadcasts to peers happen inside; keeping transport
/// concerns out lets tests drive the router end-to-end.
pub(crate) async fn process_text(state: &AppState, ctx: &mut ConnCtx, text: &str) -> Vec<ServerEvent> {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(conn_id = %ctx.conn_id, error = %e, "ws: invalid inbound event");
            return vec![ServerEvent::Error {
                reason: ErrorReason::InvalidPayload,
                message: format!("invalid event: {e}"),
            }];
        }
    };
    process_event(state, ctx, event).await
}

/// The event router: exhaustive dispatch over `ClientEvent`. Errors are
/// converted to targeted `error` events here — never broadcast, never
/// propagated past this boundary.
pub(crate) async fn process_event(
    state: &AppState,
    ctx: &mut ConnCtx,
    event: ClientEvent,
) -> Vec<ServerEvent> {
    let result = match event {
        ClientEvent::Authenticate { token } => return handle_authenticate(state, ctx, &token).await,
        ClientEvent::JoinWorkspace { workspace_id } => handle_join(state, ctx, workspace_id).await,
        ClientEvent::LeaveWorkspace { workspace_id } => {
            handle_leave(state, ctx, workspace_id).await;
            Ok(Vec::new())
        }
        ClientEvent::CursorMove { workspace_id, x, y } => {
            handle_cursor_move(state, ctx, workspace_id, x, y).await
        }
        ClientEvent::NoteUpdated { workspace_id, note_id, title, content } => {
            handle_note_updated(state, ctx, workspace_id, note_id, title, content).await
        }
        ClientEvent::NoteMoved { workspace_id, note_id, x, y, width, height } => {
            handle_note_moved(state, ctx, workspace_id, note_id, x, y, width, height).await
        }
        ClientEvent::NoteCreated { workspace_id, note } => {
            handle_note_created(state, ctx, workspace_id, note).await
        }
        ClientEvent::ConnectionCreated { workspace_id, from_id, to_id, label, color, style } => {
            handle_edge_event(state, ctx, workspace_id, |user_id| ServerEvent::ConnectionCreated {
                workspace_id,
                from_id,
                to_id,
                label,
                color,
                style,
                user_id,
            })
            .await
        }
        ClientEvent::ConnectionUpdated { workspace_id, connection_id, label, color, style } => {
            handle_edge_event(state, ctx, workspace_id, |user_id| ServerEvent::ConnectionUpdated {
                workspace_id,
                connection_id,
                label,
                color,
                style,
                user_id,
            })
            .await
        }
        ClientEvent::ConnectionDeleted { workspace_id, connection_id } => {
            handle_edge_event(state, ctx, workspace_id, |user_id| ServerEvent::ConnectionDeleted {
                workspace_id,
                connection_id,
                user_id,
            })
            .await
        }
        ClientEvent::ChatMessage { workspace_id, content } => {
            handle_chat(state, ctx, workspace_id, &content).await
        }
        ClientEvent::TypingStart { workspace_id } => handle_typing(state, ctx, workspace_id, true).await,
        ClientEvent::TypingStop { workspace_id } => handle_typing(state, ctx, workspace_id, false).await,
    };

    match result {
        Ok(replies) => replies,
        Err(e) => vec![e.error_event()],
    }
}

// =============================================================================
// GUARDS
// =============================================================================

/// Mutating entry points reject unauthenticated connections with an
/// explicit error event, never a silent drop.
fn require_user(ctx: &ConnCtx) -> Result<UserIdentity, EventError> {
    ctx.user.clone().ok_or(EventError::Unauthenticated)
}

/// Auth + edit-access gate shared by every content mutation.
async fn require_edit(
    state: &AppState,
    ctx: &ConnCtx,
    workspace_id: Uuid,
) -> Result<UserIdentity, EventError> {
    let user = require_user(ctx)?;
    if !access::can_edit(state.store.as_ref(), user.id, workspace_id).await? {
        return Err(EventError::AccessDenied(workspace_id));
    }
    Ok(user)
}

// =============================================================================
// AUTH
// =============================================================================

async fn handle_authenticate(state: &AppState, ctx: &mut ConnCtx, token: &str) -> Vec<ServerEvent> {
    if ctx.user.is_some() {
        return vec![ServerEvent::Error {
            reason: ErrorReason::InvalidPayload,
            message: "connection already authenticated".into(),
        }];
    }

    match state.store.verify_credential(token).await {
        Ok(Some(user)) => {
            info!(conn_id = %ctx.conn_id, user_id = %user.id, "ws: authenticated");
            set_online_fire_and_forget(state, user.id, true);
            ctx.user = Some(user.clone());
            vec![ServerEvent::Authenticated { user }]
        }
        Ok(None) => {
            debug!(conn_id = %ctx.conn_id, "ws: credential rejected");
            vec![ServerEvent::AuthenticationFailed]
        }
        Err(e) => {
            warn!(conn_id = %ctx.conn_id, error = %e, "ws: credential verification failed");
            vec![ServerEvent::Error {
                reason: ErrorReason::PersistenceFailed,
                message: "credential verification unavailable".into(),
            }]
        }
    }
}

/// Flip the durable online flag without coupling the realtime path to the
/// write: failures are logged and otherwise ignored.
fn set_online_fire_and_forget(state: &AppState, user_id: Uuid, online: bool) {
    let store = state.store.clone();
    tokio::spawn(async move {
        if let Err(e) = store.set_user_online(user_id, online).await {
            warn!(%user_id, online, error = %e, "online status update failed");
        }
    });
}

// =============================================================================
// ROOMS
// =============================================================================

async fn handle_join(
    state: &AppState,
    ctx: &mut ConnCtx,
    workspace_id: Uuid,
) -> Result<Vec<ServerEvent>, EventError> {
    let user = require_user(ctx)?;

    // One workspace room at a time: joining a new one leaves the previous.
    if let Some(previous) = ctx.workspace {
        if previous != workspace_id {
            rooms::leave_workspace(state, ctx.conn_id, previous).await;
            ctx.workspace = None;
        }
    }

    let roster =
        rooms::join_workspace(state, ctx.conn_id, &user, workspace_id, ctx.tx.clone()).await?;
    ctx.workspace = Some(workspace_id);

    Ok(vec![ServerEvent::WorkspaceUsers { users: roster }])
}

async fn handle_leave(state: &AppState, ctx: &mut ConnCtx, workspace_id: Uuid) {
    if ctx.workspace == Some(workspace_id) {
        rooms::leave_workspace(state, ctx.conn_id, workspace_id).await;
        ctx.workspace = None;
    }
}

// =============================================================================
// CURSOR
// =============================================================================

async fn handle_cursor_move(
    state: &AppState,
    ctx: &ConnCtx,
    workspace_id: Uuid,
    x: f64,
    y: f64,
) -> Result<Vec<ServerEvent>, EventError> {
    let user = require_user(ctx)?;
    // Room membership gates cursors; no store call on this hot path.
    if ctx.workspace != Some(workspace_id) {
        return Err(EventError::NotInRoom);
    }

    let event = ServerEvent::CursorUpdate {
        user_id: user.id,
        name: user.name.clone(),
        x,
        y,
        color: user_color(user.id),
    };
    rooms::broadcast(state, workspace_id, &event, Some(ctx.conn_id)).await;
    Ok(Vec::new())
}

// =============================================================================
// NOTES
// =============================================================================

async fn handle_note_updated(
    state: &AppState,
    ctx: &ConnCtx,
    workspace_id: Uuid,
    note_id: Uuid,
    title: Option<String>,
    content: Option<String>,
) -> Result<Vec<ServerEvent>, EventError> {
    if title.is_none() && content.is_none() {
        return Err(EventError::InvalidPayload("note-updated requires title or content".into()));
    }
    let user = require_edit(state, ctx, workspace_id).await?;

    let patch = NotePatch { title: title.clone(), content: content.clone(), ..NotePatch::default() };
    state.store.update_note(note_id, patch).await?;

    // Content edits are audit-worthy; geometry updates are not (see
    // handle_note_moved).
    state
        .store
        .create_activity(ActivityEntry {
            kind: "NOTE_UPDATED".into(),
            title: "Note updated".into(),
            description: format!("Note {note_id} was updated in real time"),
            user_id: user.id,
            workspace_id,
            metadata: serde_json::json!({
                "noteId": note_id,
                "fields": {
                    "title": title.is_some(),
                    "content": content.is_some(),
                },
            }),
        })
        .await?;

    let event = ServerEvent::NoteUpdated { workspace_id, note_id, title, content, user_id: user.id };
    rooms::broadcast(state, workspace_id, &event, Some(ctx.conn_id)).await;
    Ok(Vec::new())
}

#[allow(clippy::too_many_arguments)]
async fn handle_note_moved(
    state: &AppState,
    ctx: &ConnCtx,
    workspace_id: Uuid,
    note_id: Uuid,
    x: f64,
    y: f64,
    width: Option<f64>,
    height: Option<f64>,
) -> Result<Vec<ServerEvent>, EventError> {
    let user = require_edit(state, ctx, workspace_id).await?;

    // Geometry-only write. Deliberately no activity entry: drags emit one
    // of these per pixel and would flood the audit trail.
    let patch = NotePatch { x: Some(x), y: Some(y), width, height, ..NotePatch::default() };
    state.store.update_note(note_id, patch).await?;

    let event = ServerEvent::NoteMoved { workspace_id, note_id, x, y, width, height, user_id: user.id };
    rooms::broadcast(state, workspace_id, &event, Some(ctx.conn_id)).await;
    Ok(Vec::new())
}

/// Note-to-note edge events share one shape: edit access gate, no durable
/// effect at this layer, broadcast excluding the sender.
async fn handle_edge_event(
    state: &AppState,
    ctx: &ConnCtx,
    workspace_id: Uuid,
    build: impl FnOnce(Uuid) -> ServerEvent,
) -> Result<Vec<ServerEvent>, EventError> {
    let user = require_edit(state, ctx, workspace_id).await?;
    let event = build(user.id);
    rooms::broadcast(state, workspace_id, &event, Some(ctx.conn_id)).await;
    Ok(Vec::new())
}

async fn handle_note_created(
    state: &AppState,
    ctx: &ConnCtx,
    workspace_id: Uuid,
    note: serde_json::Value,
) -> Result<Vec<ServerEvent>, EventError> {
    let user = require_edit(state, ctx, workspace_id).await?;

    // The REST path persisted the note before this event fired; this layer
    // only propagates the record to peers.
    let event = ServerEvent::NoteCreated { workspace_id, note, user_id: user.id };
    rooms::broadcast(state, workspace_id, &event, Some(ctx.conn_id)).await;
    Ok(Vec::new())
}

// =============================================================================
// CHAT
// =============================================================================

async fn handle_chat(
    state: &AppState,
    ctx: &ConnCtx,
    workspace_id: Option<Uuid>,
    content: &str,
) -> Result<Vec<ServerEvent>, EventError> {
    let user = require_user(ctx)?;
    chat::send_message(state, &user, workspace_id, content).await?;
    Ok(Vec::new())
}

async fn handle_typing(
    state: &AppState,
    ctx: &ConnCtx,
    workspace_id: Option<Uuid>,
    is_typing: bool,
) -> Result<Vec<ServerEvent>, EventError> {
    let user = require_user(ctx)?;
    chat::set_typing(state, ctx.conn_id, &user, workspace_id, is_typing).await?;
    Ok(Vec::new())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
