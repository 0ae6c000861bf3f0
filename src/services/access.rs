//! Access Verifier — the authorization gate for rooms and mutations.
//!
//! DESIGN
//! ======
//! Both checks delegate to the store, so they are as slow as a Postgres
//! round trip. Callers must never hold the room lock across them. A check
//! can go stale between verification and the action it guards (concurrent
//! role demotion); that race is an accepted tolerance for a collaboration
//! gate, not a security boundary for irreversible actions.

use uuid::Uuid;

use crate::store::{Store, StoreError};

/// Can the user see the workspace at all: owner, member, or public.
///
/// # Errors
///
/// Returns a store error if a lookup fails.
pub async fn can_view(store: &dyn Store, user_id: Uuid, workspace_id: Uuid) -> Result<bool, StoreError> {
    if store.workspace_owner(workspace_id).await? == Some(user_id) {
        return Ok(true);
    }
    if store.workspace_membership(user_id, workspace_id).await?.is_some() {
        return Ok(true);
    }
    store.is_workspace_public(workspace_id).await
}

/// Can the user mutate workspace content: owner, or a non-read-only member.
/// Public visibility grants no edit rights.
///
/// # Errors
///
/// Returns a store error if a lookup fails.
pub async fn can_edit(store: &dyn Store, user_id: Uuid, workspace_id: Uuid) -> Result<bool, StoreError> {
    if store.workspace_owner(workspace_id).await? == Some(user_id) {
        return Ok(true);
    }
    let membership = store.workspace_membership(user_id, workspace_id).await?;
    Ok(membership.is_some_and(|m| m.role.can_edit()))
}

#[cfg(test)]
#[path = "access_test.rs"]
mod tests;
