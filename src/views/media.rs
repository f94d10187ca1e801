use axum::{
    debug_handler,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    appresult::{AppResult, PortalError},
    db::{self, MediaCategory, MediaItem},
    feed::{ChangeEvent, ChangeFeed, ChangeOp, Table},
    storage::Bucket,
    tracker::Tracker,
    viewer::Viewer,
    AppState,
};

/// Upload ceiling for a single file.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

pub struct NewMediaItem {
    pub organization_id: Uuid,
    pub uploader_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: i64,
    pub category: MediaCategory,
}

pub async fn insert_media_item(db_pool: &SqlitePool, new: NewMediaItem, created_at: i64) -> sqlx::Result<MediaItem> {
    sqlx::query_as(
        "INSERT INTO media_items (id,organization_id,uploader_id,file_path,file_name,mime_type,size,category,created_at)
         VALUES (?,?,?,?,?,?,?,?,?) RETURNING *",
    )
    .bind(Uuid::now_v7())
    .bind(new.organization_id)
    .bind(new.uploader_id)
    .bind(&new.file_path)
    .bind(&new.file_name)
    .bind(&new.mime_type)
    .bind(new.size)
    .bind(new.category)
    .bind(created_at)
    .fetch_one(db_pool)
    .await
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaView {
    #[serde(flatten)]
    pub item: MediaItem,
    pub url: String,
}

impl MediaView {
    pub fn new(bucket: &Bucket, item: MediaItem) -> Self {
        Self { url: bucket.public_url(&item.file_path), item }
    }
}

/// Newest first.
pub async fn list_media(db_pool: &SqlitePool, organization_id: Uuid) -> sqlx::Result<Vec<MediaItem>> {
    sqlx::query_as("SELECT * FROM media_items WHERE organization_id=? ORDER BY created_at DESC, rowid DESC")
        .bind(organization_id)
        .fetch_all(db_pool)
        .await
}

/// Loads the library and marks it read for the viewer.
pub async fn open_media(tracker: &Tracker, bucket: &Bucket, viewer: Viewer, organization_id: Uuid) -> AppResult<Vec<MediaView>> {
    viewer.ensure_access(tracker.db_pool(), organization_id).await?;
    let items = list_media(tracker.db_pool(), organization_id).await?;
    tracker.mark_read(organization_id, viewer.user_id()).await?;
    Ok(items.into_iter().map(|item| MediaView::new(bucket, item)).collect())
}

pub(crate) fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "file".to_owned(),
        name => name.to_owned(),
    }
}

pub struct Upload {
    pub file_name: String,
    pub mime_type: String,
    pub category: MediaCategory,
    pub bytes: Vec<u8>,
}

/// Stores the blob, records it, and announces it. The read cursor is left alone.
pub async fn upload(
    tracker: &Tracker,
    feed: &ChangeFeed,
    bucket: &Bucket,
    viewer: Viewer,
    organization_id: Uuid,
    upload: Upload,
) -> AppResult<MediaItem> {
    viewer.ensure_access(tracker.db_pool(), organization_id).await?;
    if upload.bytes.is_empty() {
        return Err(PortalError::Validation("file is empty".to_owned()))?;
    }
    let id = Uuid::now_v7();
    let file_path = format!("{organization_id}/{id}-{}", sanitize_file_name(&upload.file_name));
    bucket.upload(&file_path, &upload.bytes).await?;

    let new = NewMediaItem {
        organization_id,
        uploader_id: viewer.user_id(),
        file_path: file_path.clone(),
        file_name: upload.file_name,
        mime_type: upload.mime_type,
        size: upload.bytes.len() as i64,
        category: upload.category,
    };
    let item = match insert_media_item(tracker.db_pool(), new, db::now_millis()).await {
        Ok(item) => item,
        Err(err) => {
            bucket.remove(&file_path).await?;
            return Err(err)?;
        }
    };
    feed.publish(ChangeEvent {
        table: Table::MediaItems,
        op: ChangeOp::Insert,
        organization_id,
        row_id: Some(item.id),
        actor_id: viewer.user_id(),
    });
    tracing::info!(id = %item.id, %organization_id, size = item.size, "media uploaded");
    Ok(item)
}

/// Only the uploader or an admin may delete. The item must belong to `organization_id`.
pub async fn delete(
    tracker: &Tracker,
    feed: &ChangeFeed,
    bucket: &Bucket,
    viewer: Viewer,
    organization_id: Uuid,
    id: Uuid,
) -> AppResult<()> {
    let item = db::media_item(tracker.db_pool(), id)
        .await?
        .filter(|item| item.organization_id == organization_id)
        .ok_or(PortalError::NotFound("media item"))?;
    viewer.ensure_access(tracker.db_pool(), item.organization_id).await?;
    if !viewer.is_admin() && item.uploader_id != viewer.user_id() {
        return Err(PortalError::Forbidden("only the uploader can delete this file"))?;
    }

    bucket.remove(&item.file_path).await?;
    sqlx::query("DELETE FROM media_items WHERE id=?")
        .bind(id)
        .execute(tracker.db_pool())
        .await?;
    feed.publish(ChangeEvent {
        table: Table::MediaItems,
        op: ChangeOp::Delete,
        organization_id: item.organization_id,
        row_id: Some(id),
        actor_id: viewer.user_id(),
    });
    Ok(())
}

/// Reads a stored blob through the same access rules as the library it belongs to.
pub async fn fetch(db_pool: &SqlitePool, bucket: &Bucket, viewer: Viewer, path: &str) -> AppResult<(MediaItem, Vec<u8>)> {
    let item: MediaItem = sqlx::query_as("SELECT * FROM media_items WHERE file_path=?")
        .bind(path)
        .fetch_optional(db_pool)
        .await?
        .ok_or(PortalError::NotFound("media item"))?;
    viewer.ensure_access(db_pool, item.organization_id).await?;
    let bytes = bucket.download(&item.file_path).await?;
    Ok((item, bytes))
}

#[debug_handler(state = AppState)]
pub(crate) async fn list(
    State(tracker): State<Tracker>,
    State(bucket): State<Bucket>,
    viewer: Viewer,
    Path(org): Path<Uuid>,
) -> AppResult<Json<Vec<MediaView>>> {
    Ok(Json(open_media(&tracker, &bucket, viewer, org).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn create(
    State(tracker): State<Tracker>,
    State(feed): State<ChangeFeed>,
    State(bucket): State<Bucket>,
    viewer: Viewer,
    Path(org): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut file = None;
    let mut category = MediaCategory::BrandAssets;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("category") => {
                let text = field.text().await?;
                category = serde_json::from_value(serde_json::Value::String(text))
                    .map_err(|_| PortalError::Validation("unknown media category".to_owned()))?;
            }
            Some("file") => {
                let file_name = field.file_name().unwrap_or("file").to_owned();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_owned();
                file = Some((file_name, mime_type, field.bytes().await?.to_vec()));
            }
            _ => {}
        }
    }
    let (file_name, mime_type, bytes) = file.ok_or_else(|| PortalError::Validation("missing file".to_owned()))?;

    let item = upload(&tracker, &feed, &bucket, viewer, org, Upload { file_name, mime_type, category, bytes }).await?;
    Ok((StatusCode::CREATED, Json(MediaView::new(&bucket, item))))
}

#[debug_handler(state = AppState)]
pub(crate) async fn remove(
    State(tracker): State<Tracker>,
    State(feed): State<ChangeFeed>,
    State(bucket): State<Bucket>,
    viewer: Viewer,
    Path((org, id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    delete(&tracker, &feed, &bucket, viewer, org, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppState)]
pub(crate) async fn download(
    State(db_pool): State<SqlitePool>,
    State(bucket): State<Bucket>,
    viewer: Viewer,
    Path(path): Path<String>,
) -> AppResult<impl IntoResponse> {
    let (item, bytes) = fetch(&db_pool, &bucket, viewer, &path).await?;
    let disposition = format!("inline; filename=\"{}\"", sanitize_file_name(&item.file_name));
    Ok((
        [(header::CONTENT_TYPE, item.mime_type), (header::CONTENT_DISPOSITION, disposition)],
        bytes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{testing, MemberRole, Role},
        feed::{Delivery, Filter},
        orgs,
        tracker::ContentKind,
    };

    struct World {
        _dir: tempfile::TempDir,
        bucket: Bucket,
        feed: ChangeFeed,
        tracker: Tracker,
        admin: Viewer,
        customer: Viewer,
        acme: Uuid,
    }

    async fn world() -> World {
        let db_pool = testing::pool().await;
        let dir = tempfile::tempdir().unwrap();
        let feed = ChangeFeed::new(16);
        let acme = testing::organization(&db_pool, "Acme").await.id;
        let ada = testing::profile(&db_pool, "Ada", Role::Admin).await;
        let casey = testing::profile(&db_pool, "Casey", Role::Customer).await;
        orgs::add_member(&db_pool, acme, casey.id, MemberRole::Owner).await.unwrap();
        World {
            bucket: Bucket::new("media", dir.path(), "http://localhost:8080"),
            _dir: dir,
            tracker: Tracker::new(db_pool, feed.clone()),
            feed,
            admin: Viewer::from_profile(&ada),
            customer: Viewer::from_profile(&casey),
            acme,
        }
    }

    fn logo() -> Upload {
        Upload {
            file_name: "Logo Final (2).png".to_owned(),
            mime_type: "image/png".to_owned(),
            category: MediaCategory::BrandAssets,
            bytes: b"png".to_vec(),
        }
    }

    #[test]
    fn file_names_are_made_path_safe() {
        assert_eq!(sanitize_file_name("Logo Final (2).png"), "Logo_Final__2_.png");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(".."), "file");
    }

    #[tokio::test]
    async fn upload_stores_records_and_announces() {
        let w = world().await;
        let mut sub = w.feed.subscribe(&[Table::MediaItems], Filter::Organization(w.acme));

        let item = upload(&w.tracker, &w.feed, &w.bucket, w.customer, w.acme, logo()).await.unwrap();
        assert!(item.file_path.starts_with(&format!("{}/", w.acme)));
        assert_eq!(item.file_name, "Logo Final (2).png");
        assert!(matches!(sub.try_recv(), Some(Delivery::Event(e)) if e.row_id == Some(item.id)));

        assert!(w.tracker.has_unread(w.acme, w.admin, ContentKind::Media).await.unwrap());
        assert!(!w.tracker.has_unread(w.acme, w.customer, ContentKind::Media).await.unwrap());

        let (fetched, bytes) = fetch(w.tracker.db_pool(), &w.bucket, w.admin, &item.file_path).await.unwrap();
        assert_eq!((fetched.id, bytes.as_slice()), (item.id, b"png".as_slice()));

        let library = open_media(&w.tracker, &w.bucket, w.admin, w.acme).await.unwrap();
        assert_eq!(library[0].url, format!("http://localhost:8080/media/{}", item.file_path));
        assert!(!w.tracker.has_unread(w.acme, w.admin, ContentKind::Media).await.unwrap());
    }

    #[tokio::test]
    async fn outsiders_cannot_fetch_or_delete() {
        let w = world().await;
        let item = upload(&w.tracker, &w.feed, &w.bucket, w.admin, w.acme, logo()).await.unwrap();
        let stranger = Viewer::from_profile(&testing::profile(w.tracker.db_pool(), "Sam", Role::Customer).await);

        let err = fetch(w.tracker.db_pool(), &w.bucket, stranger, &item.file_path).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::Forbidden(_))));

        let err = delete(&w.tracker, &w.feed, &w.bucket, w.customer, w.acme, item.id).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::Forbidden(_))));
    }

    #[tokio::test]
    async fn delete_removes_blob_and_row() {
        let w = world().await;
        let item = upload(&w.tracker, &w.feed, &w.bucket, w.customer, w.acme, logo()).await.unwrap();

        delete(&w.tracker, &w.feed, &w.bucket, w.customer, w.acme, item.id).await.unwrap();
        assert!(db::media_item(w.tracker.db_pool(), item.id).await.unwrap().is_none());
        let err = w.bucket.download(&item.file_path).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_through_another_organization_is_not_found() {
        let w = world().await;
        let globex = testing::organization(w.tracker.db_pool(), "Globex").await.id;
        let item = upload(&w.tracker, &w.feed, &w.bucket, w.customer, w.acme, logo()).await.unwrap();

        let err = delete(&w.tracker, &w.feed, &w.bucket, w.admin, globex, item.id).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::NotFound(_))));
        assert!(db::media_item(w.tracker.db_pool(), item.id).await.unwrap().is_some());
        assert_eq!(w.bucket.download(&item.file_path).await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn uploading_leaves_unviewed_chat_unread() {
        let w = world().await;
        testing::message_at(w.tracker.db_pool(), w.acme, w.customer.user_id(), "any news?", 5).await;
        assert!(w.tracker.has_unread(w.acme, w.admin, ContentKind::Messages).await.unwrap());

        upload(&w.tracker, &w.feed, &w.bucket, w.admin, w.acme, logo()).await.unwrap();
        assert!(w.tracker.has_unread(w.acme, w.admin, ContentKind::Messages).await.unwrap());
        assert!(w.tracker.has_unread(w.acme, w.customer, ContentKind::Media).await.unwrap());
    }
}
