use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::request::Parts,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    appresult::{AppError, AppResult, PortalError},
    db::{self, Profile, Role},
    session::USER_ID,
    AppState,
};

/// Who is looking. Everything role-dependent branches on this, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Viewer {
    Admin { user_id: Uuid },
    OrganizationMember { user_id: Uuid },
}

impl Viewer {
    pub fn from_profile(profile: &Profile) -> Self {
        match profile.role {
            Role::Admin => Viewer::Admin { user_id: profile.id },
            Role::Customer => Viewer::OrganizationMember { user_id: profile.id },
        }
    }

    pub fn user_id(&self) -> Uuid {
        match *self {
            Viewer::Admin { user_id } | Viewer::OrganizationMember { user_id } => user_id,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Viewer::Admin { .. })
    }

    /// The role whose writes count as news for this viewer.
    pub fn counterpart(&self) -> Role {
        match self {
            Viewer::Admin { .. } => Role::Customer,
            Viewer::OrganizationMember { .. } => Role::Admin,
        }
    }

    pub fn require_admin(&self) -> AppResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(PortalError::Forbidden("admin only"))?
        }
    }

    /// Admins see every organization; members only their own.
    pub async fn ensure_access(&self, db_pool: &SqlitePool, organization_id: Uuid) -> AppResult<()> {
        if db::organization(db_pool, organization_id).await?.is_none() {
            return Err(PortalError::NotFound("organization"))?;
        }
        if self.is_admin() || db::is_member(db_pool, organization_id, self.user_id()).await? {
            Ok(())
        } else {
            Err(PortalError::Forbidden("not a member of this organization"))?
        }
    }

    /// Organizations this viewer can see, by name.
    pub async fn organizations(&self, db_pool: &SqlitePool) -> sqlx::Result<Vec<db::Organization>> {
        match self {
            Viewer::Admin { .. } => {
                sqlx::query_as("SELECT * FROM organizations ORDER BY name")
                    .fetch_all(db_pool)
                    .await
            }
            Viewer::OrganizationMember { user_id } => {
                sqlx::query_as(
                    "SELECT o.* FROM organizations o \
                     JOIN organization_members m ON m.organization_id = o.id \
                     WHERE m.user_id = ? ORDER BY o.name",
                )
                .bind(user_id)
                .fetch_all(db_pool)
                .await
            }
        }
    }
}

async fn session_viewer(parts: &mut Parts, state: &AppState) -> AppResult<Option<Viewer>> {
    let Ok(session) = <Session as FromRequestParts<AppState>>::from_request_parts(parts, state).await else {
        return Ok(None);
    };
    let Some(user_id) = session.get::<Uuid>(USER_ID).await? else {
        return Ok(None);
    };
    Ok(db::profile(&state.db_pool, user_id)
        .await?
        .as_ref()
        .map(Viewer::from_profile))
}

impl FromRequestParts<AppState> for Viewer {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        session_viewer(parts, state)
            .await?
            .ok_or_else(|| PortalError::Unauthorized.into())
    }
}

impl OptionalFromRequestParts<AppState> for Viewer {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Option<Self>, Self::Rejection> {
        session_viewer(parts, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::testing, orgs};

    #[test]
    fn counterpart_is_the_opposite_role() {
        let id = Uuid::now_v7();
        assert_eq!(Viewer::Admin { user_id: id }.counterpart(), Role::Customer);
        assert_eq!(Viewer::OrganizationMember { user_id: id }.counterpart(), Role::Admin);
    }

    #[tokio::test]
    async fn members_only_reach_their_own_organizations() {
        let db_pool = testing::pool().await;
        let mine = testing::organization(&db_pool, "Acme").await;
        let other = testing::organization(&db_pool, "Globex").await;
        let casey = testing::profile(&db_pool, "Casey", Role::Customer).await;
        orgs::add_member(&db_pool, mine.id, casey.id, db::MemberRole::Member).await.unwrap();

        let viewer = Viewer::from_profile(&casey);
        assert!(viewer.ensure_access(&db_pool, mine.id).await.is_ok());
        let denied = viewer.ensure_access(&db_pool, other.id).await.unwrap_err();
        assert!(matches!(denied.portal(), Some(PortalError::Forbidden(_))));

        let names: Vec<_> = viewer.organizations(&db_pool).await.unwrap().into_iter().map(|o| o.name).collect();
        assert_eq!(names, ["Acme"]);
    }

    #[tokio::test]
    async fn admins_see_everything() {
        let db_pool = testing::pool().await;
        testing::organization(&db_pool, "Globex").await;
        testing::organization(&db_pool, "Acme").await;
        let ada = testing::profile(&db_pool, "Ada", Role::Admin).await;

        let viewer = Viewer::from_profile(&ada);
        let names: Vec<_> = viewer.organizations(&db_pool).await.unwrap().into_iter().map(|o| o.name).collect();
        assert_eq!(names, ["Acme", "Globex"]);
        let missing = viewer.ensure_access(&db_pool, Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(missing.portal(), Some(PortalError::NotFound(_))));
    }
}
