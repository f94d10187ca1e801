use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::Context;

/// Runtime settings, read once at startup from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind: SocketAddr,
    pub public_url: String,
    pub media_dir: PathBuf,
    pub client_secrets: Option<PathBuf>,
    pub admin_emails: Vec<String>,
    pub leads_api_key: Option<String>,
    pub session_minutes: i64,
    pub feed_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://portal.db?mode=rwc".to_owned(),
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_url: "http://localhost:8080".to_owned(),
            media_dir: PathBuf::from("./media"),
            client_secrets: None,
            admin_emails: Vec::new(),
            leads_api_key: None,
            session_minutes: 60,
            feed_capacity: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            bind: parsed("PORTAL_BIND")?.unwrap_or(defaults.bind),
            public_url: var("PORTAL_PUBLIC_URL")
                .map(|url| url.trim_end_matches('/').to_owned())
                .unwrap_or(defaults.public_url),
            media_dir: var("PORTAL_MEDIA_DIR").map(PathBuf::from).unwrap_or(defaults.media_dir),
            client_secrets: var("PORTAL_CLIENT_SECRETS").map(PathBuf::from),
            admin_emails: var("PORTAL_ADMIN_EMAILS")
                .map(|list| {
                    list.split(',')
                        .map(|email| email.trim().to_lowercase())
                        .filter(|email| !email.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            leads_api_key: var("LEADS_API_KEY"),
            session_minutes: parsed("PORTAL_SESSION_MINUTES")?.unwrap_or(defaults.session_minutes),
            feed_capacity: parsed("PORTAL_FEED_CAPACITY")?.unwrap_or(defaults.feed_capacity),
        })
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        let email = email.to_lowercase();
        self.admin_emails.iter().any(|admin| *admin == email)
    }
}

fn var(key: &str) -> Option<String> {
    dotenv::var(key).ok().filter(|value| !value.is_empty())
}

fn parsed<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|value| value.parse::<T>().with_context(|| format!("{key}={value}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_emails_match_case_insensitively() {
        let config = Config {
            admin_emails: vec!["ops@agency.test".to_owned()],
            ..Config::default()
        };
        assert!(config.is_admin_email("Ops@Agency.test"));
        assert!(!config.is_admin_email("client@example.test"));
    }
}
