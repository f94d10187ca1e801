//! Contracts and invoices an admin shares with one organization. Members
//! read them; only admins add, re-status or remove them.

use axum::{
    debug_handler,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    appresult::{AppResult, PortalError},
    db,
    storage::Bucket,
    viewer::Viewer,
    views::media::{sanitize_file_name, MAX_UPLOAD_BYTES},
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/o/{org}/files",
            get(list).post(create).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/o/{org}/files/{id}", get(download).patch(update).delete(remove))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum FileKind {
    Contract,
    Invoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Signed,
    Rejected,
    Unpaid,
    Paid,
    Overdue,
}

impl FileKind {
    pub fn initial_status(self) -> FileStatus {
        match self {
            FileKind::Contract => FileStatus::Pending,
            FileKind::Invoice => FileStatus::Unpaid,
        }
    }

    /// Contracts get signed, invoices get paid.
    pub fn allows(self, status: FileStatus) -> bool {
        use FileStatus::*;
        match self {
            FileKind::Contract => matches!(status, Pending | Signed | Rejected),
            FileKind::Invoice => matches!(status, Unpaid | Paid | Overdue),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ClientFile {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub title: String,
    pub kind: FileKind,
    pub status: FileStatus,
    pub file_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub uploaded_by: Uuid,
    pub created_at: i64,
}

impl ClientFile {
    pub fn url(&self) -> String {
        format!("/o/{}/files/{}", self.organization_id, self.id)
    }
}

#[derive(Debug, Serialize)]
pub struct FileView {
    #[serde(flatten)]
    pub file: ClientFile,
    pub url: String,
}

impl From<ClientFile> for FileView {
    fn from(file: ClientFile) -> Self {
        Self { url: file.url(), file }
    }
}

pub struct NewFile {
    pub title: String,
    pub kind: FileKind,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Newest first.
pub async fn list_files(db_pool: &SqlitePool, organization_id: Uuid) -> sqlx::Result<Vec<ClientFile>> {
    sqlx::query_as("SELECT * FROM client_files WHERE organization_id=? ORDER BY created_at DESC, rowid DESC")
        .bind(organization_id)
        .fetch_all(db_pool)
        .await
}

async fn client_file(db_pool: &SqlitePool, organization_id: Uuid, id: Uuid) -> AppResult<ClientFile> {
    let file = sqlx::query_as("SELECT * FROM client_files WHERE id=? AND organization_id=?")
        .bind(id)
        .bind(organization_id)
        .fetch_optional(db_pool)
        .await?
        .ok_or(PortalError::NotFound("file"))?;
    Ok(file)
}

pub async fn create_file(
    db_pool: &SqlitePool,
    bucket: &Bucket,
    viewer: Viewer,
    organization_id: Uuid,
    new: NewFile,
) -> AppResult<ClientFile> {
    viewer.require_admin()?;
    viewer.ensure_access(db_pool, organization_id).await?;
    let title = new.title.trim();
    if title.is_empty() || new.bytes.is_empty() {
        return Err(PortalError::Validation("Please fill in all fields and select a file.".to_owned()))?;
    }

    let id = Uuid::now_v7();
    let file_path = format!("contracts/{organization_id}/{id}-{}", sanitize_file_name(&new.file_name));
    bucket.upload(&file_path, &new.bytes).await?;
    let inserted = sqlx::query_as(
        "INSERT INTO client_files (id,organization_id,title,kind,status,file_path,file_name,mime_type,uploaded_by,created_at)
         VALUES (?,?,?,?,?,?,?,?,?,?) RETURNING *",
    )
    .bind(id)
    .bind(organization_id)
    .bind(title)
    .bind(new.kind)
    .bind(new.kind.initial_status())
    .bind(&file_path)
    .bind(&new.file_name)
    .bind(&new.mime_type)
    .bind(viewer.user_id())
    .bind(db::now_millis())
    .fetch_one(db_pool)
    .await;
    let file: ClientFile = match inserted {
        Ok(file) => file,
        Err(err) => {
            bucket.remove(&file_path).await?;
            return Err(err)?;
        }
    };
    tracing::info!(%id, %organization_id, kind = ?file.kind, "shared file");
    Ok(file)
}

pub async fn set_status(
    db_pool: &SqlitePool,
    viewer: Viewer,
    organization_id: Uuid,
    id: Uuid,
    status: FileStatus,
) -> AppResult<ClientFile> {
    viewer.require_admin()?;
    let file = client_file(db_pool, organization_id, id).await?;
    if !file.kind.allows(status) {
        return Err(PortalError::Validation(format!("{status:?} does not apply to a {:?}", file.kind).to_lowercase()))?;
    }
    let file = sqlx::query_as("UPDATE client_files SET status=? WHERE id=? RETURNING *")
        .bind(status)
        .bind(id)
        .fetch_one(db_pool)
        .await?;
    Ok(file)
}

pub async fn delete_file(db_pool: &SqlitePool, bucket: &Bucket, viewer: Viewer, organization_id: Uuid, id: Uuid) -> AppResult<()> {
    viewer.require_admin()?;
    let file = client_file(db_pool, organization_id, id).await?;
    bucket.remove(&file.file_path).await?;
    sqlx::query("DELETE FROM client_files WHERE id=?")
        .bind(id)
        .execute(db_pool)
        .await?;
    tracing::info!(%id, %organization_id, "removed file");
    Ok(())
}

pub async fn fetch_file(
    db_pool: &SqlitePool,
    bucket: &Bucket,
    viewer: Viewer,
    organization_id: Uuid,
    id: Uuid,
) -> AppResult<(ClientFile, Vec<u8>)> {
    viewer.ensure_access(db_pool, organization_id).await?;
    let file = client_file(db_pool, organization_id, id).await?;
    let bytes = bucket.download(&file.file_path).await?;
    Ok((file, bytes))
}

#[debug_handler(state = AppState)]
async fn list(State(db_pool): State<SqlitePool>, viewer: Viewer, Path(org): Path<Uuid>) -> AppResult<Json<Vec<FileView>>> {
    viewer.ensure_access(&db_pool, org).await?;
    let files = list_files(&db_pool, org).await?;
    Ok(Json(files.into_iter().map(FileView::from).collect()))
}

#[debug_handler(state = AppState)]
async fn create(
    State(db_pool): State<SqlitePool>,
    State(bucket): State<Bucket>,
    viewer: Viewer,
    Path(org): Path<Uuid>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let mut title = String::new();
    let mut kind = FileKind::Contract;
    let mut file = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("title") => title = field.text().await?,
            Some("kind") => {
                let text = field.text().await?;
                kind = serde_json::from_value(serde_json::Value::String(text.to_lowercase()))
                    .map_err(|_| PortalError::Validation("kind must be contract or invoice".to_owned()))?;
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

    let new = NewFile { title, kind, file_name, mime_type, bytes };
    let file = create_file(&db_pool, &bucket, viewer, org, new).await?;
    Ok((StatusCode::CREATED, Json(FileView::from(file))))
}

#[derive(Debug, Deserialize)]
struct StatusChange {
    status: FileStatus,
}

#[debug_handler(state = AppState)]
async fn update(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Path((org, id)): Path<(Uuid, Uuid)>,
    Json(StatusChange { status }): Json<StatusChange>,
) -> AppResult<Json<FileView>> {
    Ok(Json(set_status(&db_pool, viewer, org, id, status).await?.into()))
}

#[debug_handler(state = AppState)]
async fn remove(
    State(db_pool): State<SqlitePool>,
    State(bucket): State<Bucket>,
    viewer: Viewer,
    Path((org, id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    delete_file(&db_pool, &bucket, viewer, org, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppState)]
async fn download(
    State(db_pool): State<SqlitePool>,
    State(bucket): State<Bucket>,
    viewer: Viewer,
    Path((org, id)): Path<(Uuid, Uuid)>,
) -> AppResult<impl IntoResponse> {
    let (file, bytes) = fetch_file(&db_pool, &bucket, viewer, org, id).await?;
    let disposition = format!("attachment; filename=\"{}\"", sanitize_file_name(&file.file_name));
    Ok((
        [(header::CONTENT_TYPE, file.mime_type), (header::CONTENT_DISPOSITION, disposition)],
        bytes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{testing, MemberRole, Role},
        orgs,
    };

    struct World {
        _dir: tempfile::TempDir,
        db_pool: SqlitePool,
        bucket: Bucket,
        admin: Viewer,
        customer: Viewer,
        acme: Uuid,
        globex: Uuid,
    }

    async fn world() -> World {
        let db_pool = testing::pool().await;
        let dir = tempfile::tempdir().unwrap();
        let ada = testing::profile(&db_pool, "Ada", Role::Admin).await;
        let casey = testing::profile(&db_pool, "Casey", Role::Customer).await;
        let acme = testing::organization(&db_pool, "Acme").await.id;
        let globex = testing::organization(&db_pool, "Globex").await.id;
        orgs::add_member(&db_pool, acme, casey.id, MemberRole::Owner).await.unwrap();
        World {
            bucket: Bucket::new("media", dir.path(), "http://localhost:8080"),
            _dir: dir,
            db_pool,
            admin: Viewer::from_profile(&ada),
            customer: Viewer::from_profile(&casey),
            acme,
            globex,
        }
    }

    fn invoice() -> NewFile {
        NewFile {
            title: " March invoice ".to_owned(),
            kind: FileKind::Invoice,
            file_name: "invoice-03.pdf".to_owned(),
            mime_type: "application/pdf".to_owned(),
            bytes: b"%PDF".to_vec(),
        }
    }

    #[test]
    fn statuses_follow_the_kind() {
        assert_eq!(FileKind::Contract.initial_status(), FileStatus::Pending);
        assert_eq!(FileKind::Invoice.initial_status(), FileStatus::Unpaid);
        assert!(FileKind::Contract.allows(FileStatus::Signed));
        assert!(!FileKind::Contract.allows(FileStatus::Paid));
        assert!(FileKind::Invoice.allows(FileStatus::Overdue));
        assert!(!FileKind::Invoice.allows(FileStatus::Rejected));
    }

    #[tokio::test]
    async fn admins_share_and_members_read() {
        let w = world().await;
        let file = create_file(&w.db_pool, &w.bucket, w.admin, w.acme, invoice()).await.unwrap();
        assert_eq!(file.title, "March invoice");
        assert_eq!(file.status, FileStatus::Unpaid);
        assert!(file.file_path.starts_with(&format!("contracts/{}/", w.acme)));

        let listed = list_files(&w.db_pool, w.acme).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(list_files(&w.db_pool, w.globex).await.unwrap().is_empty());

        let (fetched, bytes) = fetch_file(&w.db_pool, &w.bucket, w.customer, w.acme, file.id).await.unwrap();
        assert_eq!((fetched.id, bytes.as_slice()), (file.id, b"%PDF".as_slice()));
    }

    #[tokio::test]
    async fn members_cannot_share_or_fetch_elsewhere() {
        let w = world().await;
        let err = create_file(&w.db_pool, &w.bucket, w.customer, w.acme, invoice()).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::Forbidden(_))));

        let file = create_file(&w.db_pool, &w.bucket, w.admin, w.globex, invoice()).await.unwrap();
        let err = fetch_file(&w.db_pool, &w.bucket, w.customer, w.globex, file.id).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::Forbidden(_))));

        // right id, wrong organization
        let err = fetch_file(&w.db_pool, &w.bucket, w.customer, w.acme, file.id).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::NotFound(_))));
    }

    #[tokio::test]
    async fn status_changes_must_fit_the_kind() {
        let w = world().await;
        let file = create_file(&w.db_pool, &w.bucket, w.admin, w.acme, invoice()).await.unwrap();

        let paid = set_status(&w.db_pool, w.admin, w.acme, file.id, FileStatus::Paid).await.unwrap();
        assert_eq!(paid.status, FileStatus::Paid);

        let err = set_status(&w.db_pool, w.admin, w.acme, file.id, FileStatus::Signed).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::Validation(_))));
        let err = set_status(&w.db_pool, w.customer, w.acme, file.id, FileStatus::Unpaid).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::Forbidden(_))));
    }

    #[tokio::test]
    async fn delete_removes_blob_and_row() {
        let w = world().await;
        let file = create_file(&w.db_pool, &w.bucket, w.admin, w.acme, invoice()).await.unwrap();

        let err = delete_file(&w.db_pool, &w.bucket, w.admin, w.globex, file.id).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::NotFound(_))));

        delete_file(&w.db_pool, &w.bucket, w.admin, w.acme, file.id).await.unwrap();
        assert!(list_files(&w.db_pool, w.acme).await.unwrap().is_empty());
        let err = w.bucket.download(&file.file_path).await.unwrap_err();
        assert!(matches!(err.portal(), Some(PortalError::NotFound(_))));
    }
}
