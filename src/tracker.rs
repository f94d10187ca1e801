//! Read cursors and the unread flags derived from them.
//!
//! Content is unread for a viewer when it lives in the organization, is newer
//! than the viewer's cursor there, was not written by the viewer, and was written
//! by the opposite role. Authors whose profile does not resolve never count.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::{self, Role},
    feed::{ChangeEvent, ChangeFeed, ChangeOp, Table},
    viewer::Viewer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Messages,
    Media,
}

impl ContentKind {
    pub const ALL: [ContentKind; 2] = [ContentKind::Messages, ContentKind::Media];

    pub fn table(self) -> Table {
        match self {
            ContentKind::Messages => Table::Messages,
            ContentKind::Media => Table::MediaItems,
        }
    }

    pub fn of_table(table: Table) -> Option<Self> {
        match table {
            Table::Messages => Some(ContentKind::Messages),
            Table::MediaItems => Some(ContentKind::Media),
            Table::MessageReads => None,
        }
    }

    /// (table, author column)
    fn source(self) -> (&'static str, &'static str) {
        match self {
            ContentKind::Messages => ("messages", "sender_id"),
            ContentKind::Media => ("media_items", "uploader_id"),
        }
    }
}

#[derive(Clone)]
pub struct Tracker {
    db_pool: SqlitePool,
    feed: ChangeFeed,
}

impl Tracker {
    pub fn new(db_pool: SqlitePool, feed: ChangeFeed) -> Self {
        Self { db_pool, feed }
    }

    pub fn db_pool(&self) -> &SqlitePool {
        &self.db_pool
    }

    /// Epoch zero when the user has never opened the organization.
    pub async fn last_read_at(&self, organization_id: Uuid, user_id: Uuid) -> sqlx::Result<i64> {
        Ok(sqlx::query_as::<_, (i64,)>(
            "SELECT last_read_at FROM message_reads WHERE organization_id=? AND user_id=?",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(&self.db_pool)
        .await?
        .map_or(0, |(at,)| at))
    }

    pub async fn has_unread(&self, organization_id: Uuid, viewer: Viewer, kind: ContentKind) -> sqlx::Result<bool> {
        let (table, author) = kind.source();
        let (unread,): (bool,) = sqlx::query_as(&format!(
            "SELECT EXISTS (
                SELECT 1 FROM {table} c JOIN profiles p ON p.id = c.{author}
                WHERE c.organization_id = ?1 AND c.{author} <> ?2 AND p.role = ?3
                  AND c.created_at > COALESCE(
                    (SELECT last_read_at FROM message_reads WHERE organization_id = ?1 AND user_id = ?2), 0)
            )"
        ))
        .bind(organization_id)
        .bind(viewer.user_id())
        .bind(viewer.counterpart())
        .fetch_one(&self.db_pool)
        .await?;
        Ok(unread)
    }

    /// Badge count for one organization.
    pub async fn unread_count(&self, organization_id: Uuid, viewer: Viewer, kind: ContentKind) -> sqlx::Result<i64> {
        let (table, author) = kind.source();
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {table} c JOIN profiles p ON p.id = c.{author}
             WHERE c.organization_id = ?1 AND c.{author} <> ?2 AND p.role = ?3
               AND c.created_at > COALESCE(
                 (SELECT last_read_at FROM message_reads WHERE organization_id = ?1 AND user_id = ?2), 0)"
        ))
        .bind(organization_id)
        .bind(viewer.user_id())
        .bind(viewer.counterpart())
        .fetch_one(&self.db_pool)
        .await?;
        Ok(count)
    }

    /// Same answer as [`Tracker::has_unread`] per organization, in two queries
    /// regardless of how many organizations are asked about.
    pub async fn compute_unread_map(
        &self,
        organization_ids: &[Uuid],
        viewer: Viewer,
        kind: ContentKind,
    ) -> sqlx::Result<HashMap<Uuid, bool>> {
        let receipts: HashMap<Uuid, i64> = sqlx::query_as::<_, (Uuid, i64)>(
            "SELECT organization_id, last_read_at FROM message_reads WHERE user_id=?",
        )
        .bind(viewer.user_id())
        .fetch_all(&self.db_pool)
        .await?
        .into_iter()
        .collect();

        let (table, author) = kind.source();
        let latest: HashMap<Uuid, i64> = sqlx::query_as::<_, (Uuid, i64)>(&format!(
            "SELECT c.organization_id, MAX(c.created_at) FROM {table} c
             JOIN profiles p ON p.id = c.{author}
             WHERE c.{author} <> ?1 AND p.role = ?2
             GROUP BY c.organization_id"
        ))
        .bind(viewer.user_id())
        .bind(viewer.counterpart())
        .fetch_all(&self.db_pool)
        .await?
        .into_iter()
        .collect();

        Ok(organization_ids
            .iter()
            .map(|id| {
                let read = receipts.get(id).copied().unwrap_or(0);
                (*id, latest.get(id).is_some_and(|newest| *newest > read))
            })
            .collect())
    }

    /// Whether anything the viewer can see is unread.
    pub async fn any_unread(&self, viewer: Viewer, kind: ContentKind) -> sqlx::Result<bool> {
        let ids: Vec<Uuid> = viewer
            .organizations(&self.db_pool)
            .await?
            .into_iter()
            .map(|org| org.id)
            .collect();
        Ok(self
            .compute_unread_map(&ids, viewer, kind)
            .await?
            .into_values()
            .any(|unread| unread))
    }

    pub async fn mark_read(&self, organization_id: Uuid, user_id: Uuid) -> sqlx::Result<i64> {
        self.mark_read_at(organization_id, user_id, db::now_millis()).await
    }

    /// Advances the cursor to `at`. A cursor already past `at` stays put; the
    /// stored value is returned.
    pub async fn mark_read_at(&self, organization_id: Uuid, user_id: Uuid, at: i64) -> sqlx::Result<i64> {
        let (last_read_at,): (i64,) = sqlx::query_as(
            "INSERT INTO message_reads (organization_id, user_id, last_read_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (organization_id, user_id)
             DO UPDATE SET last_read_at = MAX(last_read_at, excluded.last_read_at)
             RETURNING last_read_at",
        )
        .bind(organization_id)
        .bind(user_id)
        .bind(at)
        .fetch_one(&self.db_pool)
        .await?;

        tracing::debug!(%organization_id, %user_id, last_read_at, "marked read");
        self.feed.publish(ChangeEvent {
            table: Table::MessageReads,
            op: ChangeOp::Update,
            organization_id,
            row_id: None,
            actor_id: user_id,
        });
        Ok(last_read_at)
    }

    /// Role of the author of a live event, if it resolves.
    pub async fn author_role(&self, author_id: Uuid) -> sqlx::Result<Option<Role>> {
        db::role_of(&self.db_pool, author_id).await
    }
}
