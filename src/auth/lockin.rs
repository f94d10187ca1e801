use std::sync::Arc;

use anyhow::anyhow;
use axum::{debug_handler, extract::{Path, Query, State}, response::Redirect};
use oauth2::{AuthorizationCode, CsrfToken, PkceCodeVerifier, TokenResponse};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_sessions::Session;

use crate::{config::Config, session::{CSRF_STATE, PKCE_VERIFIER, RETURN_URL, USER_ID}, AppResult, AppState, GetField};

use super::{clients::ClientProvider, ensure_profile, Clients, Identity};

#[derive(Deserialize)]
pub struct LockinQuery {
    pub state: Option<String>,
    pub code: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdpRequest {
    post_body: String,
    request_uri: String,
    return_idp_credential: bool,
    return_secure_token: bool,
}

#[debug_handler(state = AppState)]
pub(crate) async fn lockin(
    Path(provider): Path<ClientProvider>,
    Query(LockinQuery { state, code }): Query<LockinQuery>,
    State(db_pool): State<SqlitePool>,
    State(clients): State<Clients>,
    State(config): State<Arc<Config>>,
    session: Session,
) -> AppResult<Redirect> {
    let state = CsrfToken::new(state.ok_or_else(|| anyhow!("OAuth: without state"))?);
    let code = AuthorizationCode::new(code.ok_or_else(|| anyhow!("OAuth: without code"))?);

    let Some(stored_state) = session.remove::<String>(CSRF_STATE).await? else {
        return Err(anyhow!("no csrf_state"))?;
    };
    if state.secret().as_str() != stored_state.as_str() {
        return Err(anyhow!("csrf tokens don't match"))?;
    }
    let Some(pkce_verifier) = session.remove::<String>(PKCE_VERIFIER).await? else {
        return Err(anyhow!("no pkce_verifier"))?;
    };

    let identity_url = clients
        .identity_url
        .as_deref()
        .ok_or_else(|| anyhow!("identity platform key not supplied"))?;
    let client = clients.get_client(provider)?;
    let http_client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let token_result = client
        .exchange_code(code)
        .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
        .request_async(&http_client)
        .await?;

    let access_token = token_result.access_token().secret();
    let body: serde_json::Value = http_client.post(identity_url)
        .json(&IdpRequest {
            post_body: format!("access_token={access_token}&providerId={}", provider.id()),
            request_uri: config.public_url.clone(),
            return_idp_credential: true,
            return_secure_token: true,
        })
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let auth_id = body.get_str_field("localId")?;
    let email = body.get_str_field("email").ok();
    let full_name = body
        .get_str_field("displayName")
        .or_else(|_| body.get_str_field("fullName"))
        .unwrap_or_else(|_| email.clone().unwrap_or_else(|| "New client".to_owned()));

    let profile = ensure_profile(&db_pool, &config, Identity { auth_id, email, full_name }).await?;
    session.cycle_id().await?;
    session.insert(USER_ID, profile.id).await?;
    tracing::info!(user_id = %profile.id, role = ?profile.role, %provider, "signed in");

    let return_url: Option<String> = session.remove(RETURN_URL).await?;
    Ok(Redirect::to(return_url.as_deref().unwrap_or("/")))
}
