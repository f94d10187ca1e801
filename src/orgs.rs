use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    appresult::{AppResult, PortalError},
    db::{self, MemberRole, Organization, Role},
    viewer::Viewer,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orgs", get(list).post(create))
        .route("/join", post(join))
        .route("/orgs/{org}/members", get(members))
        .route("/orgs/{org}/members/{user}", delete(remove_member))
}

fn access_code() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect()
}

pub async fn create_organization(
    db_pool: &SqlitePool,
    name: &str,
    access_code: Option<&str>,
) -> AppResult<Organization> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PortalError::Validation("organization name is required".to_owned()))?;
    }
    let org = Organization {
        id: Uuid::now_v7(),
        name: name.to_owned(),
        access_code: access_code
            .map(|code| code.trim().to_ascii_uppercase())
            .unwrap_or_else(self::access_code),
        created_at: db::now_millis(),
    };
    let inserted = sqlx::query("INSERT INTO organizations (id,name,access_code,created_at) VALUES (?,?,?,?)")
        .bind(org.id)
        .bind(&org.name)
        .bind(&org.access_code)
        .bind(org.created_at)
        .execute(db_pool)
        .await;
    match inserted {
        Ok(_) => {
            tracing::info!(id = %org.id, name = %org.name, "created organization");
            Ok(org)
        }
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            Err(PortalError::Conflict("access code already in use".to_owned()))?
        }
        Err(err) => Err(err)?,
    }
}

pub async fn add_member(
    db_pool: &SqlitePool,
    organization_id: Uuid,
    user_id: Uuid,
    role: MemberRole,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "INSERT INTO organization_members (organization_id,user_id,role,created_at) VALUES (?,?,?,?)
         ON CONFLICT DO NOTHING",
    )
    .bind(organization_id)
    .bind(user_id)
    .bind(role)
    .bind(db::now_millis())
    .execute(db_pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Adds the viewer to the organization holding `code`.
pub async fn join_by_code(db_pool: &SqlitePool, viewer: Viewer, code: &str) -> AppResult<Organization> {
    let Some(org): Option<Organization> = sqlx::query_as("SELECT * FROM organizations WHERE access_code=?")
        .bind(code.trim().to_ascii_uppercase())
        .fetch_optional(db_pool)
        .await?
    else {
        return Err(PortalError::Validation("Invalid access code. Please try again.".to_owned()))?;
    };

    if !add_member(db_pool, org.id, viewer.user_id(), MemberRole::Member).await? {
        return Err(PortalError::Conflict("You are already a member of this organization.".to_owned()))?;
    }
    tracing::info!(organization_id = %org.id, user_id = %viewer.user_id(), "joined organization");
    Ok(org)
}

#[derive(Debug, Serialize, FromRow)]
pub struct MemberView {
    pub user_id: Uuid,
    pub full_name: String,
    pub email: Option<String>,
    pub profile_role: Role,
    pub role: MemberRole,
    pub created_at: i64,
}

pub async fn list_members(db_pool: &SqlitePool, organization_id: Uuid) -> sqlx::Result<Vec<MemberView>> {
    sqlx::query_as(
        "SELECT m.user_id, p.full_name, p.email, p.role AS profile_role, m.role, m.created_at
         FROM organization_members m JOIN profiles p ON p.id = m.user_id
         WHERE m.organization_id = ? ORDER BY m.created_at, m.rowid",
    )
    .bind(organization_id)
    .fetch_all(db_pool)
    .await
}

#[debug_handler(state = AppState)]
async fn list(State(db_pool): State<SqlitePool>, viewer: Viewer) -> AppResult<Json<Vec<Organization>>> {
    Ok(Json(viewer.organizations(&db_pool).await?))
}

#[derive(Deserialize)]
pub(crate) struct NewOrganization {
    name: String,
    access_code: Option<String>,
}

#[debug_handler(state = AppState)]
async fn create(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Json(NewOrganization { name, access_code }): Json<NewOrganization>,
) -> AppResult<impl IntoResponse> {
    viewer.require_admin()?;
    let org = create_organization(&db_pool, &name, access_code.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(org)))
}

#[derive(Deserialize)]
pub(crate) struct JoinRequest {
    code: String,
}

#[debug_handler(state = AppState)]
async fn join(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Json(JoinRequest { code }): Json<JoinRequest>,
) -> AppResult<Json<Organization>> {
    Ok(Json(join_by_code(&db_pool, viewer, &code).await?))
}

#[debug_handler(state = AppState)]
async fn members(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Path(org): Path<Uuid>,
) -> AppResult<Json<Vec<MemberView>>> {
    viewer.ensure_access(&db_pool, org).await?;
    Ok(Json(list_members(&db_pool, org).await?))
}

#[debug_handler(state = AppState)]
async fn remove_member(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Path((org, user)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    viewer.require_admin()?;
    let removed = sqlx::query("DELETE FROM organization_members WHERE organization_id=? AND user_id=?")
        .bind(org)
        .bind(user)
        .execute(&db_pool)
        .await?;
    if removed.rows_affected() == 0 {
        return Err(PortalError::NotFound("membership"))?;
    }
    Ok(StatusCode::NO_CONTENT)
}
