//! Postgres-backed `Store` implementation.
//!
//! SYSTEM CONTEXT
//! ==============
//! Queries run against the host NoteVault schema (users, sessions,
//! workspaces, workspace_members, notes, activities, chat_messages). The
//! schema itself — migrations included — is owned by the host application;
//! this module only reads and writes existing rows.

use sqlx::{PgPool, QueryBuilder};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use super::{
    ActivityEntry, MembershipRecord, MembershipRole, NotePatch, PersistedMessage, Store,
    StoreError, UserIdentity,
};

/// SQLx-backed store handle. Cheap to clone; wraps the shared pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn verify_credential(&self, token: &str) -> Result<Option<UserIdentity>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, Option<String>, Option<String>, Option<String>, String)>(
            r"SELECT u.id, u.name, u.email, u.image, u.role
              FROM sessions s
              JOIN users u ON u.id = s.user_id
              WHERE s.token = $1
                AND s.expires_at > now()
                AND u.is_active",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, name, email, image, role)| UserIdentity {
            id,
            name: name.or(email).unwrap_or_else(|| "Unknown".into()),
            avatar_url: image,
            role,
        }))
    }

    async fn workspace_owner(&self, workspace_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let owner = sqlx::query_scalar::<_, Uuid>("SELECT owner_id FROM workspaces WHERE id = $1")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner)
    }

    async fn workspace_membership(
        &self,
        user_id: Uuid,
        workspace_id: Uuid,
    ) -> Result<Option<MembershipRecord>, StoreError> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM workspace_members WHERE user_id = $1 AND workspace_id = $2",
        )
        .bind(user_id)
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(role.map(|r| MembershipRecord { role: MembershipRole::from_db(&r) }))
    }

    async fn is_workspace_public(&self, workspace_id: Uuid) -> Result<bool, StoreError> {
        let public = sqlx::query_scalar::<_, bool>("SELECT is_public FROM workspaces WHERE id = $1")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(public.unwrap_or(false))
    }

    async fn update_note(&self, note_id: Uuid, patch: NotePatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::new("UPDATE notes SET updated_at = now()");
        if let Some(title) = &patch.title {
            builder.push(", title = ").push_bind(title);
        }
        if let Some(content) = &patch.content {
            builder.push(", content = ").push_bind(content);
        }
        if let Some(x) = patch.x {
            builder.push(", position_x = ").push_bind(x);
        }
        if let Some(y) = patch.y {
            builder.push(", position_y = ").push_bind(y);
        }
        if let Some(width) = patch.width {
            builder.push(", width = ").push_bind(width);
        }
        if let Some(height) = patch.height {
            builder.push(", height = ").push_bind(height);
        }
        builder.push(" WHERE id = ").push_bind(note_id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NoteNotFound(note_id));
        }
        Ok(())
    }

    async fn create_activity(&self, entry: ActivityEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO activities (id, type, title, description, user_id, workspace_id, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(&entry.kind)
        .bind(&entry.title)
        .bind(&entry.description)
        .bind(entry.user_id)
        .bind(entry.workspace_id)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_chat_message(
        &self,
        content: &str,
        author_id: Uuid,
    ) -> Result<PersistedMessage, StoreError> {
        let id = Uuid::new_v4();
        let created_at = sqlx::query_scalar::<_, OffsetDateTime>(
            "INSERT INTO chat_messages (id, content, author_id) VALUES ($1, $2, $3) RETURNING created_at",
        )
        .bind(id)
        .bind(content)
        .bind(author_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(PersistedMessage {
            id,
            created_at: created_at.format(&Rfc3339).unwrap_or_default(),
        })
    }

    async fn set_user_online(&self, user_id: Uuid, online: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET is_online = $2, last_seen = now() WHERE id = $1")
            .bind(user_id)
            .bind(online)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
