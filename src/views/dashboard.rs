use std::collections::HashMap;

use axum::{
    debug_handler,
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    appresult::AppResult,
    db::Organization,
    leads, orders,
    tracker::{ContentKind, Tracker},
    viewer::Viewer,
    AppState,
};

#[derive(Debug, Serialize)]
pub struct OrganizationSummary {
    #[serde(flatten)]
    pub organization: Organization,
    pub unread_messages: bool,
    pub unread_media: bool,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct AdminStats {
    pub clients: i64,
    pub new_leads: i64,
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub viewer: Viewer,
    pub organizations: Vec<OrganizationSummary>,
    pub open_orders: usize,
    pub unread_messages: bool,
    pub unread_media: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminStats>,
}

pub async fn dashboard(tracker: &Tracker, viewer: Viewer) -> AppResult<Dashboard> {
    let db_pool = tracker.db_pool();
    let organizations = viewer.organizations(db_pool).await?;
    let ids: Vec<Uuid> = organizations.iter().map(|org| org.id).collect();
    let messages = tracker.compute_unread_map(&ids, viewer, ContentKind::Messages).await?;
    let media = tracker.compute_unread_map(&ids, viewer, ContentKind::Media).await?;

    let organizations: Vec<OrganizationSummary> = organizations
        .into_iter()
        .map(|organization| OrganizationSummary {
            unread_messages: messages.get(&organization.id).copied().unwrap_or(false),
            unread_media: media.get(&organization.id).copied().unwrap_or(false),
            organization,
        })
        .collect();

    let admin = if viewer.is_admin() {
        let (clients,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM profiles WHERE role='customer'")
            .fetch_one(db_pool)
            .await?;
        Some(AdminStats { clients, new_leads: leads::new_lead_count(db_pool).await? })
    } else {
        None
    };

    Ok(Dashboard {
        viewer,
        open_orders: orders::open_order_count(db_pool, viewer).await?,
        unread_messages: organizations.iter().any(|org| org.unread_messages),
        unread_media: organizations.iter().any(|org| org.unread_media),
        organizations,
        admin,
    })
}

#[debug_handler(state = AppState)]
pub(crate) async fn index(State(tracker): State<Tracker>, viewer: Viewer) -> AppResult<Json<Dashboard>> {
    Ok(Json(dashboard(&tracker, viewer).await?))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UnreadQuery {
    #[serde(default)]
    kind: ContentKind,
}

/// Per-organization flags for one kind. Signed-out callers get an empty map.
#[debug_handler(state = AppState)]
pub(crate) async fn unread(
    State(tracker): State<Tracker>,
    viewer: Option<Viewer>,
    Query(UnreadQuery { kind }): Query<UnreadQuery>,
) -> AppResult<Json<HashMap<Uuid, bool>>> {
    let Some(viewer) = viewer else {
        return Ok(Json(HashMap::new()));
    };
    let ids: Vec<Uuid> = viewer
        .organizations(tracker.db_pool())
        .await?
        .into_iter()
        .map(|org| org.id)
        .collect();
    Ok(Json(tracker.compute_unread_map(&ids, viewer, kind).await?))
}
