//! Domain services used by the websocket event router.
//!
//! ARCHITECTURE
//! ============
//! Service modules own authorization, room membership, and persistence
//! sequencing so `routes/ws.rs` can stay focused on protocol translation
//! and dispatch.

pub mod access;
pub mod chat;
pub mod rooms;
