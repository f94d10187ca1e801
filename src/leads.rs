use axum::{
    debug_handler,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    appresult::{AppResult, PortalError},
    config::Config,
    db::{self, MemberRole, NewProfile, Profile, Role},
    orgs,
    viewer::Viewer,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/leads", post(intake))
        .route("/leads", get(list))
        .route("/leads/{id}", patch(update).delete(remove))
        .route("/leads/{id}/convert", post(convert))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Closed,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Lead {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub summary: Option<String>,
    pub source: String,
    pub status: LeadStatus,
    pub converted_profile_id: Option<Uuid>,
    pub created_at: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct NewLead {
    pub name: String,
    pub email: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub summary: Option<String>,
    pub source: Option<String>,
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

pub async fn create_lead(db_pool: &SqlitePool, new: NewLead) -> AppResult<Lead> {
    if new.name.trim().is_empty() || new.email.trim().is_empty() {
        return Err(PortalError::Validation("Name and Email are required".to_owned()))?;
    }
    let lead = Lead {
        id: Uuid::now_v7(),
        name: new.name.trim().to_owned(),
        email: new.email.trim().to_lowercase(),
        company: blank_to_none(new.company),
        phone: blank_to_none(new.phone),
        summary: blank_to_none(new.summary),
        source: blank_to_none(new.source).unwrap_or_else(|| "api".to_owned()),
        status: LeadStatus::New,
        converted_profile_id: None,
        created_at: db::now_millis(),
    };
    sqlx::query(
        "INSERT INTO leads (id,name,email,company,phone,summary,source,status,created_at) VALUES (?,?,?,?,?,?,?,?,?)",
    )
    .bind(lead.id)
    .bind(&lead.name)
    .bind(&lead.email)
    .bind(&lead.company)
    .bind(&lead.phone)
    .bind(&lead.summary)
    .bind(&lead.source)
    .bind(lead.status)
    .bind(lead.created_at)
    .execute(db_pool)
    .await?;
    tracing::info!(id = %lead.id, source = %lead.source, "lead captured");
    Ok(lead)
}

pub async fn list_leads(db_pool: &SqlitePool) -> sqlx::Result<Vec<Lead>> {
    sqlx::query_as("SELECT * FROM leads ORDER BY created_at DESC")
        .fetch_all(db_pool)
        .await
}

pub async fn new_lead_count(db_pool: &SqlitePool) -> sqlx::Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM leads WHERE status='new'")
        .fetch_one(db_pool)
        .await?;
    Ok(count)
}

/// Fields left out keep their stored value.
#[derive(Debug, Default, Deserialize)]
pub struct LeadUpdate {
    pub status: Option<LeadStatus>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub summary: Option<String>,
}

pub async fn update_lead(db_pool: &SqlitePool, id: Uuid, update: LeadUpdate) -> AppResult<Lead> {
    let name = update.name.map(|name| name.trim().to_owned());
    let email = update.email.map(|email| email.trim().to_lowercase());
    if name.as_deref() == Some("") || email.as_deref() == Some("") {
        return Err(PortalError::Validation("Name and Email are required".to_owned()))?;
    }
    let lead: Lead = sqlx::query_as(
        "UPDATE leads SET status=COALESCE(?,status), name=COALESCE(?,name), email=COALESCE(?,email), \
         company=COALESCE(?,company), phone=COALESCE(?,phone), summary=COALESCE(?,summary) \
         WHERE id=? RETURNING *",
    )
    .bind(update.status)
    .bind(name)
    .bind(email)
    .bind(blank_to_none(update.company))
    .bind(blank_to_none(update.phone))
    .bind(blank_to_none(update.summary))
    .bind(id)
    .fetch_optional(db_pool)
    .await?
    .ok_or(PortalError::NotFound("lead"))?;
    tracing::info!(%id, status = ?lead.status, "lead updated");
    Ok(lead)
}

pub async fn delete_lead(db_pool: &SqlitePool, id: Uuid) -> AppResult<()> {
    let done = sqlx::query("DELETE FROM leads WHERE id=?")
        .bind(id)
        .execute(db_pool)
        .await?;
    if done.rows_affected() == 0 {
        return Err(PortalError::NotFound("lead"))?;
    }
    tracing::info!(%id, "lead deleted");
    Ok(())
}

/// Binds a lead to a customer profile (reusing one with the same email, or
/// provisioning one that is claimed on first sign-in), optionally enrolls it in
/// an organization, and closes the lead.
pub async fn convert_lead(db_pool: &SqlitePool, id: Uuid, organization_id: Option<Uuid>) -> AppResult<Profile> {
    let lead: Lead = sqlx::query_as("SELECT * FROM leads WHERE id=?")
        .bind(id)
        .fetch_optional(db_pool)
        .await?
        .ok_or(PortalError::NotFound("lead"))?;
    if lead.converted_profile_id.is_some() {
        return Err(PortalError::Conflict("lead already converted".to_owned()))?;
    }
    if let Some(org) = organization_id {
        if db::organization(db_pool, org).await?.is_none() {
            return Err(PortalError::NotFound("organization"))?;
        }
    }

    let profile = match db::profile_by_email(db_pool, &lead.email).await? {
        Some(profile) => profile,
        None => {
            db::insert_profile(db_pool, NewProfile {
                auth_id: None,
                full_name: &lead.name,
                email: Some(&lead.email),
                role: Role::Customer,
            })
            .await?
        }
    };
    if let Some(org) = organization_id {
        orgs::add_member(db_pool, org, profile.id, MemberRole::Member).await?;
    }

    sqlx::query("UPDATE leads SET converted_profile_id=?, status=? WHERE id=?")
        .bind(profile.id)
        .bind(LeadStatus::Closed)
        .bind(id)
        .execute(db_pool)
        .await?;
    tracing::info!(lead = %id, profile = %profile.id, "lead converted");
    Ok(profile)
}

fn check_api_key(config: &Config, headers: &HeaderMap) -> AppResult<()> {
    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    match (&config.leads_api_key, presented) {
        (Some(expected), Some(presented)) if expected == presented => Ok(()),
        _ => Err(PortalError::Unauthorized)?,
    }
}

#[debug_handler(state = AppState)]
async fn intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewLead>,
) -> AppResult<impl IntoResponse> {
    check_api_key(&state.config, &headers)?;
    Ok((StatusCode::CREATED, Json(create_lead(&state.db_pool, new).await?)))
}

#[debug_handler(state = AppState)]
async fn list(State(db_pool): State<SqlitePool>, viewer: Viewer) -> AppResult<Json<Vec<Lead>>> {
    viewer.require_admin()?;
    Ok(Json(list_leads(&db_pool).await?))
}

#[debug_handler(state = AppState)]
async fn update(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Path(id): Path<Uuid>,
    Json(changes): Json<LeadUpdate>,
) -> AppResult<Json<Lead>> {
    viewer.require_admin()?;
    Ok(Json(update_lead(&db_pool, id, changes).await?))
}

#[debug_handler(state = AppState)]
async fn remove(State(db_pool): State<SqlitePool>, viewer: Viewer, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    viewer.require_admin()?;
    delete_lead(&db_pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConvertRequest {
    organization_id: Option<Uuid>,
}

#[debug_handler(state = AppState)]
async fn convert(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Path(id): Path<Uuid>,
    Json(ConvertRequest { organization_id }): Json<ConvertRequest>,
) -> AppResult<Json<Profile>> {
    viewer.require_admin()?;
    Ok(Json(convert_lead(&db_pool, id, organization_id).await?))
}
