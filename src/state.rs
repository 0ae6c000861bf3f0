//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor and
//! owned by the host process — no module-level globals. It holds the store
//! handle, the connection registry (every open socket, which doubles as
//! the public chat room's subscriber set), and the workspace room table.
//!
//! All state here is transient and rebuilt from reconnects; nothing is
//! persisted by this layer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::protocol::ServerEvent;
use crate::store::{Store, UserIdentity};

// =============================================================================
// ROOM STATE
// =============================================================================

/// One member of a workspace room: the identity cached at authenticate
/// time plus the connection's outbound sender.
pub struct RoomMember {
    pub user: UserIdentity,
    pub tx: mpsc::Sender<ServerEvent>,
}

/// Per-workspace room state. Created lazily on first join, removed when
/// the member map empties.
#[derive(Default)]
pub struct RoomState {
    /// Members keyed by connection id.
    pub members: HashMap<Uuid, RoomMember>,
    /// Reverse index: user id -> connection id. At most one connection per
    /// user per room; a newer connection displaces the older one.
    pub user_conns: HashMap<Uuid, Uuid>,
}

impl RoomState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct users currently present, for the join-time roster.
    #[must_use]
    pub fn roster(&self) -> Vec<UserIdentity> {
        self.members.values().map(|m| m.user.clone()).collect()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state. Clone is required by Axum — all inner fields
/// are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    /// Every open connection, authenticated or not. Anonymous connections
    /// receive public broadcasts but cannot emit mutating events.
    pub conns: Arc<RwLock<HashMap<Uuid, mpsc::Sender<ServerEvent>>>>,
    /// Workspace rooms keyed by workspace id.
    pub rooms: Arc<RwLock<HashMap<Uuid, RoomState>>>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            conns: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
