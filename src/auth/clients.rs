use std::{fmt, path::Path};

use anyhow::anyhow;
use oauth2::{basic::BasicClient, AuthUrl, Client, ClientId, ClientSecret, RedirectUrl, TokenUrl};
use serde::Deserialize;
use serde_json::Value;

use crate::{AppResult, GetField};

pub type OAuthClient = Client<oauth2::StandardErrorResponse<oauth2::basic::BasicErrorResponseType>, oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>, oauth2::StandardTokenIntrospectionResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>, oauth2::StandardRevocableToken, oauth2::StandardErrorResponse<oauth2::RevocationErrorResponseType>, oauth2::EndpointSet, oauth2::EndpointNotSet, oauth2::EndpointNotSet, oauth2::EndpointNotSet, oauth2::EndpointSet>;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientProvider {
    Google,
    Github,
}

impl ClientProvider {
    /// Provider id as the identity platform names it.
    pub fn id(&self) -> &str {
        use ClientProvider::*;
        match self {
            Google => "google.com",
            Github => "github.com",
        }
    }

    fn key(&self) -> &'static str {
        use ClientProvider::*;
        match self {
            Google => "google",
            Github => "github",
        }
    }

    fn endpoints(&self) -> (&'static str, &'static str) {
        use ClientProvider::*;
        match self {
            Google => ("https://accounts.google.com/o/oauth2/auth", "https://oauth2.googleapis.com/token"),
            Github => ("https://github.com/login/oauth/authorize", "https://github.com/login/oauth/access_token"),
        }
    }
}

impl fmt::Display for ClientProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OAuth clients per provider plus the identity platform that turns a
/// provider token into a stable account id.
#[derive(Clone, Default)]
pub struct Clients {
    pub(crate) identity_url: Option<String>,
    google_client: Option<OAuthClient>,
    github_client: Option<OAuthClient>,
}

impl Clients {
    pub fn from_json(json: &Value, public_url: &str) -> AppResult<Clients> {
        let identity_url = match json.get("identity") {
            Some(identity) => Some(format!(
                "https://identitytoolkit.googleapis.com/v1/accounts:signInWithIdp?key={}",
                identity.get_str_field("apikey")?
            )),
            None => None,
        };

        Ok(Clients {
            identity_url,
            google_client: Self::provider(json, ClientProvider::Google, public_url)?,
            github_client: Self::provider(json, ClientProvider::Github, public_url)?,
        })
    }

    pub async fn from_file(path: &Path, public_url: &str) -> AppResult<Clients> {
        let json: Value = serde_json::from_str(&tokio::fs::read_to_string(path).await?)?;
        Self::from_json(&json, public_url)
    }

    fn provider(json: &Value, provider: ClientProvider, public_url: &str) -> AppResult<Option<OAuthClient>> {
        let Some(json) = json.get(provider.key()) else {
            return Ok(None);
        };
        let client_id = ClientId::new(json.get_str_field("client_id")?);
        let client_secret = ClientSecret::new(json.get_str_field("client_secret")?);

        let (auth_url, token_url) = provider.endpoints();
        let auth_url = AuthUrl::new(auth_url.to_owned())?;
        let token_url = TokenUrl::new(token_url.to_owned())?;
        let redirect_url = RedirectUrl::new(format!("{public_url}/lockin/{}", provider.key()))?;

        Ok(Some(
            BasicClient::new(client_id)
                .set_client_secret(client_secret)
                .set_auth_uri(auth_url)
                .set_token_uri(token_url)
                .set_redirect_uri(redirect_url),
        ))
    }

    pub fn get_client(&self, provider: ClientProvider) -> AppResult<OAuthClient> {
        use ClientProvider::*;
        match provider {
            Google => self.google_client.clone(),
            Github => self.github_client.clone(),
        }
        .ok_or_else(|| anyhow!("OAuth provider {provider} keys not supplied").into())
    }
}
