use anyhow::Result;
use oauth2::TokenResponse;
use oauth2::basic::BasicClient;
use oauth2::reqwest::http_client;
use oauth2::{AuthUrl, ClientId, ClientSecret, RefreshToken, TokenUrl};

use crate::config::Config;

/// Tokens returned by the provider's token endpoint (in-memory)
#[derive(Debug, Clone)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// Exchanges a refresh token for a fresh access token.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, refresh_token: &str) -> Result<Tokens>;
}

/// Google token endpoint, driven through the oauth2 crate.
pub struct GoogleTokenRefresher {
    client_id: String,
    client_secret: Option<String>,
    auth_url: String,
    token_url: String,
}

impl GoogleTokenRefresher {
    pub fn from_config(cfg: &Config, client_secret: Option<String>) -> Self {
        Self {
            client_id: cfg.client_id.clone(),
            client_secret,
            auth_url: cfg.gmail.auth_url.clone(),
            token_url: cfg.gmail.token_url.clone(),
        }
    }
}

impl TokenRefresher for GoogleTokenRefresher {
    fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        refresh_access_token(
            &self.client_id,
            self.client_secret.as_deref(),
            &self.auth_url,
            &self.token_url,
            refresh_token,
        )
    }
}

/// Exchange a refresh token for a new access token using the oauth2 crate
pub fn refresh_access_token(
    client_id: &str,
    client_secret: Option<&str>,
    auth_url: &str,
    token_url: &str,
    refresh_token: &str,
) -> Result<Tokens> {
    let client_id = ClientId::new(client_id.to_string());
    let client_secret = client_secret.map(|s| ClientSecret::new(s.to_string()));

    let auth_url = AuthUrl::new(auth_url.to_string())?;
    let token_url = TokenUrl::new(token_url.to_string())?;

    let oauth_client = BasicClient::new(client_id, client_secret, auth_url, Some(token_url));

    let rt = RefreshToken::new(refresh_token.to_string());
    let token = oauth_client
        .exchange_refresh_token(&rt)
        .request(http_client)?;

    let access = token.access_token().secret().to_string();
    let refresh = token.refresh_token().map(|r| r.secret().to_string());
    let expires = token.expires_in().map(|d| d.as_secs());

    Ok(Tokens {
        access_token: access,
        refresh_token: refresh,
        expires_in: expires,
    })
}
