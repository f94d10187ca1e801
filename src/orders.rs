use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json as SqlJson, FromRow, SqlitePool};
use uuid::Uuid;

use crate::{
    appresult::{AppResult, PortalError},
    db,
    viewer::Viewer,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list).post(create))
        .route("/orders/{id}", patch(update).delete(remove))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Design,
    Production,
    Shipped,
    Completed,
}

impl OrderStatus {
    /// Where on the four-step production timeline this status sits.
    pub fn default_step(self) -> i64 {
        use OrderStatus::*;
        match self {
            Pending | Design => 1,
            Production => 2,
            Shipped => 3,
            Completed => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub item: String,
    pub qty: u32,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub status: OrderStatus,
    pub timeline_step: i64,
    pub price_cents: i64,
    pub details: SqlJson<Vec<LineItem>>,
    pub last_status_update: i64,
    pub created_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct NewOrder {
    pub organization_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub price_cents: i64,
    pub details: Vec<LineItem>,
}

pub async fn create_order(db_pool: &SqlitePool, new: NewOrder) -> AppResult<Order> {
    if new.name.trim().is_empty() || new.details.is_empty() || new.details.iter().any(|d| d.item.trim().is_empty()) {
        return Err(PortalError::Validation(
            "Please fill in the order name, client, and at least one item.".to_owned(),
        ))?;
    }
    if db::organization(db_pool, new.organization_id).await?.is_none() {
        return Err(PortalError::NotFound("organization"))?;
    }

    let now = db::now_millis();
    let order = Order {
        id: Uuid::now_v7(),
        organization_id: new.organization_id,
        name: new.name.trim().to_owned(),
        status: OrderStatus::Pending,
        timeline_step: OrderStatus::Pending.default_step(),
        price_cents: new.price_cents.max(0),
        details: SqlJson(new.details),
        last_status_update: now,
        created_at: now,
    };
    sqlx::query(
        "INSERT INTO orders (id,organization_id,name,status,timeline_step,price_cents,details,last_status_update,created_at)
         VALUES (?,?,?,?,?,?,?,?,?)",
    )
    .bind(order.id)
    .bind(order.organization_id)
    .bind(&order.name)
    .bind(order.status)
    .bind(order.timeline_step)
    .bind(order.price_cents)
    .bind(&order.details)
    .bind(order.last_status_update)
    .bind(order.created_at)
    .execute(db_pool)
    .await?;
    tracing::info!(id = %order.id, organization_id = %order.organization_id, "created order");
    Ok(order)
}

/// Newest first. Members only see their organizations' orders.
pub async fn list_orders(db_pool: &SqlitePool, viewer: Viewer) -> sqlx::Result<Vec<Order>> {
    match viewer {
        Viewer::Admin { .. } => {
            sqlx::query_as("SELECT * FROM orders ORDER BY created_at DESC")
                .fetch_all(db_pool)
                .await
        }
        Viewer::OrganizationMember { user_id } => {
            sqlx::query_as(
                "SELECT o.* FROM orders o
                 JOIN organization_members m ON m.organization_id = o.organization_id
                 WHERE m.user_id = ? ORDER BY o.created_at DESC",
            )
            .bind(user_id)
            .fetch_all(db_pool)
            .await
        }
    }
}

pub async fn open_order_count(db_pool: &SqlitePool, viewer: Viewer) -> sqlx::Result<usize> {
    Ok(list_orders(db_pool, viewer)
        .await?
        .iter()
        .filter(|order| order.status != OrderStatus::Completed)
        .count())
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: OrderStatus,
    /// Overrides the status's default step.
    pub timeline_step: Option<i64>,
}

pub async fn change_status(db_pool: &SqlitePool, id: Uuid, change: StatusChange) -> AppResult<Order> {
    let step = change.timeline_step.unwrap_or_else(|| change.status.default_step());
    if !(1..=4).contains(&step) {
        return Err(PortalError::Validation(format!("timeline step {step} is outside 1..=4")))?;
    }
    let order: Option<Order> = sqlx::query_as(
        "UPDATE orders SET status=?, timeline_step=?, last_status_update=? WHERE id=? RETURNING *",
    )
    .bind(change.status)
    .bind(step)
    .bind(db::now_millis())
    .bind(id)
    .fetch_optional(db_pool)
    .await?;
    let order = order.ok_or(PortalError::NotFound("order"))?;
    tracing::info!(%id, status = ?order.status, step, "order status changed");
    Ok(order)
}

#[debug_handler(state = AppState)]
async fn list(State(db_pool): State<SqlitePool>, viewer: Viewer) -> AppResult<Json<Vec<Order>>> {
    Ok(Json(list_orders(&db_pool, viewer).await?))
}

#[debug_handler(state = AppState)]
async fn create(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Json(new): Json<NewOrder>,
) -> AppResult<impl IntoResponse> {
    viewer.require_admin()?;
    Ok((StatusCode::CREATED, Json(create_order(&db_pool, new).await?)))
}

#[debug_handler(state = AppState)]
async fn update(
    State(db_pool): State<SqlitePool>,
    viewer: Viewer,
    Path(id): Path<Uuid>,
    Json(change): Json<StatusChange>,
) -> AppResult<Json<Order>> {
    viewer.require_admin()?;
    Ok(Json(change_status(&db_pool, id, change).await?))
}

#[debug_handler(state = AppState)]
async fn remove(State(db_pool): State<SqlitePool>, viewer: Viewer, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    viewer.require_admin()?;
    let deleted = sqlx::query("DELETE FROM orders WHERE id=?").bind(id).execute(&db_pool).await?;
    if deleted.rows_affected() == 0 {
        return Err(PortalError::NotFound("order"))?;
    }
    Ok(StatusCode::NO_CONTENT)
}
