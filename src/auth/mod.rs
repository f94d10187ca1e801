use axum::{routing::get, Router};
use sqlx::SqlitePool;

use crate::{
    config::Config,
    db::{self, NewProfile, Profile, Role},
    AppResult, AppState,
};

mod clients;
mod login;
mod lockin;
mod logout;

pub use clients::{ClientProvider, Clients};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login/{provider}", get(login::login))
        .route("/lockin/{provider}", get(lockin::lockin))
        .route("/logout", get(logout::logout))
}

/// Only same-site paths are followed after sign-in or sign-out.
pub(crate) fn local_path(url: &str) -> Option<&str> {
    (url.starts_with('/') && !url.starts_with("//") && !url.contains('\\')).then_some(url)
}

/// What the identity platform tells us about a signed-in account.
pub struct Identity {
    pub auth_id: String,
    pub email: Option<String>,
    pub full_name: String,
}

/// Finds the profile for an identity. A profile provisioned ahead of time for
/// the same email (lead conversion) is claimed on first sign-in; otherwise a
/// customer profile is created. Configured admin emails always end up admin.
pub async fn ensure_profile(db_pool: &SqlitePool, config: &Config, identity: Identity) -> AppResult<Profile> {
    let admin = identity
        .email
        .as_deref()
        .is_some_and(|email| config.is_admin_email(email));

    let existing: Option<Profile> = sqlx::query_as("SELECT * FROM profiles WHERE auth_id=?")
        .bind(&identity.auth_id)
        .fetch_optional(db_pool)
        .await?;
    let existing = match (existing, identity.email.as_deref()) {
        (Some(profile), _) => Some(profile),
        (None, Some(email)) => {
            sqlx::query_as("UPDATE profiles SET auth_id=? WHERE email=? AND auth_id IS NULL RETURNING *")
                .bind(&identity.auth_id)
                .bind(email.to_lowercase())
                .fetch_optional(db_pool)
                .await?
        }
        (None, None) => None,
    };

    let profile = match existing {
        Some(profile) if admin && profile.role != Role::Admin => {
            sqlx::query_as("UPDATE profiles SET role=? WHERE id=? RETURNING *")
                .bind(Role::Admin)
                .bind(profile.id)
                .fetch_one(db_pool)
                .await?
        }
        Some(profile) => profile,
        None => {
            let profile = db::insert_profile(db_pool, NewProfile {
                auth_id: Some(&identity.auth_id),
                full_name: &identity.full_name,
                email: identity.email.as_deref(),
                role: if admin { Role::Admin } else { Role::Customer },
            })
            .await?;
            tracing::info!(user_id = %profile.id, role = ?profile.role, "created profile");
            profile
        }
    };
    Ok(profile)
}
