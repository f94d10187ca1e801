use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use pulldown_cmark::{Event, Parser};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    appresult::{AppResult, PortalError},
    db::{self, Message, Role},
    feed::{ChangeEvent, ChangeFeed, ChangeOp, Table},
    tracker::Tracker,
    viewer::Viewer,
    AppState,
};

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MessageView {
    pub id: Uuid,
    pub seq: i64,
    pub organization_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: Option<String>,
    pub sender_role: Option<Role>,
    pub content: String,
    #[sqlx(skip)]
    pub content_html: String,
    pub created_at: i64,
}

/// Markdown to HTML. Raw HTML in the source is shown as text.
pub fn render_markdown(content: &str) -> String {
    let parser = Parser::new(content).map(|event| match event {
        Event::Html(html) | Event::InlineHtml(html) => Event::Text(html),
        _ => event,
    });
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

const VIEW_SELECT: &str = "SELECT m.id, m.seq, m.organization_id, m.sender_id,
        p.full_name AS sender_name, p.role AS sender_role, m.content, m.created_at
    FROM messages m LEFT JOIN profiles p ON p.id = m.sender_id";

fn rendered(mut view: MessageView) -> MessageView {
    view.content_html = render_markdown(&view.content);
    view
}

/// Oldest first; insertion order breaks timestamp ties.
pub async fn list_messages(db_pool: &SqlitePool, organization_id: Uuid) -> sqlx::Result<Vec<MessageView>> {
    let views: Vec<MessageView> = sqlx::query_as(&format!(
        "{VIEW_SELECT} WHERE m.organization_id = ? ORDER BY m.created_at ASC, m.seq ASC"
    ))
    .bind(organization_id)
    .fetch_all(db_pool)
    .await?;
    Ok(views.into_iter().map(rendered).collect())
}

pub async fn message_view(db_pool: &SqlitePool, id: Uuid) -> sqlx::Result<Option<MessageView>> {
    let view: Option<MessageView> = sqlx::query_as(&format!("{VIEW_SELECT} WHERE m.id = ?"))
        .bind(id)
        .fetch_optional(db_pool)
        .await?;
    Ok(view.map(rendered))
}

pub async fn insert_message(
    db_pool: &SqlitePool,
    organization_id: Uuid,
    sender_id: Uuid,
    content: &str,
    created_at: i64,
) -> sqlx::Result<Message> {
    sqlx::query_as(
        "INSERT INTO messages (id,organization_id,sender_id,content,created_at) VALUES (?,?,?,?,?) RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(organization_id)
    .bind(sender_id)
    .bind(content)
    .bind(created_at)
    .fetch_one(db_pool)
    .await
}

/// Appends a message and announces it on the feed.
pub async fn send_message(
    db_pool: &SqlitePool,
    feed: &ChangeFeed,
    organization_id: Uuid,
    sender_id: Uuid,
    content: &str,
) -> AppResult<Message> {
    let content = content.trim();
    if content.is_empty() {
        return Err(PortalError::Validation("message is empty".to_owned()))?;
    }
    let message = insert_message(db_pool, organization_id, sender_id, content, db::now_millis()).await?;
    feed.publish(ChangeEvent {
        table: Table::Messages,
        op: ChangeOp::Insert,
        organization_id,
        row_id: Some(message.id),
        actor_id: sender_id,
    });
    Ok(message)
}

/// Loads the chat and marks it read for the viewer.
pub async fn open_chat(tracker: &Tracker, viewer: Viewer, organization_id: Uuid) -> AppResult<Vec<MessageView>> {
    viewer.ensure_access(tracker.db_pool(), organization_id).await?;
    let messages = list_messages(tracker.db_pool(), organization_id).await?;
    tracker.mark_read(organization_id, viewer.user_id()).await?;
    Ok(messages)
}

/// Sends as the viewer, then moves the viewer's cursor past their own write.
pub async fn post_message(
    tracker: &Tracker,
    feed: &ChangeFeed,
    viewer: Viewer,
    organization_id: Uuid,
    content: &str,
) -> AppResult<Message> {
    viewer.ensure_access(tracker.db_pool(), organization_id).await?;
    let message = send_message(tracker.db_pool(), feed, organization_id, viewer.user_id(), content).await?;
    tracker.mark_read(organization_id, viewer.user_id()).await?;
    Ok(message)
}

#[debug_handler(state = AppState)]
pub(crate) async fn list(
    State(tracker): State<Tracker>,
    viewer: Viewer,
    Path(org): Path<Uuid>,
) -> AppResult<Json<Vec<MessageView>>> {
    Ok(Json(open_chat(&tracker, viewer, org).await?))
}

#[derive(Deserialize)]
pub(crate) struct SendMessageBody {
    content: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn send(
    State(tracker): State<Tracker>,
    State(feed): State<ChangeFeed>,
    viewer: Viewer,
    Path(org): Path<Uuid>,
    Json(SendMessageBody { content }): Json<SendMessageBody>,
) -> AppResult<impl IntoResponse> {
    let message = post_message(&tracker, &feed, viewer, org, &content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{testing, MemberRole},
        orgs,
        tracker::ContentKind,
    };

    #[test]
    fn markdown_renders_and_escapes_raw_html() {
        assert_eq!(render_markdown("**proof** ready"), "<p><strong>proof</strong> ready</p>\n");
        assert!(!render_markdown("<script>x</script>").contains("<script>"));
    }

    #[tokio::test]
    async fn timestamp_ties_fall_back_to_insertion_order() {
        let db_pool = testing::pool().await;
        let org = testing::organization(&db_pool, "Acme").await;
        let ada = testing::profile(&db_pool, "Ada", Role::Admin).await;
        for content in ["first", "second", "third"] {
            insert_message(&db_pool, org.id, ada.id, content, 1_000).await.unwrap();
        }
        insert_message(&db_pool, org.id, ada.id, "earliest", 10).await.unwrap();

        let order: Vec<_> = list_messages(&db_pool, org.id).await.unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(order, ["earliest", "first", "second", "third"]);
    }

    #[tokio::test]
    async fn views_carry_sender_and_survive_missing_profiles() {
        let db_pool = testing::pool().await;
        let org = testing::organization(&db_pool, "Acme").await;
        let ada = testing::profile(&db_pool, "Ada", Role::Admin).await;
        let known = insert_message(&db_pool, org.id, ada.id, "hi", 1).await.unwrap();
        let orphan = insert_message(&db_pool, org.id, Uuid::now_v7(), "??", 2).await.unwrap();

        let known = message_view(&db_pool, known.id).await.unwrap().unwrap();
        assert_eq!((known.sender_name.as_deref(), known.sender_role), (Some("Ada"), Some(Role::Admin)));
        let orphan = message_view(&db_pool, orphan.id).await.unwrap().unwrap();
        assert_eq!((orphan.sender_name, orphan.sender_role), (None, None));
    }

    #[tokio::test]
    async fn opening_and_posting_advance_the_cursor() {
        let db_pool = testing::pool().await;
        let feed = ChangeFeed::new(16);
        let tracker = Tracker::new(db_pool.clone(), feed.clone());
        let org = testing::organization(&db_pool, "Acme").await;
        let ada = Viewer::from_profile(&testing::profile(&db_pool, "Ada", Role::Admin).await);
        let casey_profile = testing::profile(&db_pool, "Casey", Role::Customer).await;
        orgs::add_member(&db_pool, org.id, casey_profile.id, MemberRole::Owner).await.unwrap();
        let casey = Viewer::from_profile(&casey_profile);

        post_message(&tracker, &feed, casey, org.id, "is the mockup ready?").await.unwrap();
        assert!(tracker.has_unread(org.id, ada, ContentKind::Messages).await.unwrap());
        assert!(!tracker.has_unread(org.id, casey, ContentKind::Messages).await.unwrap());

        let chat = open_chat(&tracker, ada, org.id).await.unwrap();
        assert_eq!(chat.len(), 1);
        assert!(!tracker.has_unread(org.id, ada, ContentKind::Messages).await.unwrap());

        let empty = post_message(&tracker, &feed, casey, org.id, "   ").await.unwrap_err();
        assert!(matches!(empty.portal(), Some(PortalError::Validation(_))));
    }
}
