use crate::core::config::Config;
use crate::db;
use crate::utils::lock_mutex;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const DRIVE_TOKEN_KEY: &str = "drive_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Only a previously stored token, never asks the user.
    Cached,
    /// May ask the user for a new token.
    Interactive,
}

/// Source of Drive bearer tokens.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A validated token, or `None` when the mode cannot produce one.
    async fn token(&self, mode: AcquireMode) -> Result<Option<String>>;
    /// Drops `token` from the cache if it is the cached one.
    async fn invalidate(&self, token: &str) -> Result<()>;
    /// Revokes the cached token remotely and clears the cache.
    async fn revoke(&self) -> Result<()>;
}

/// Cached token first, then interactive.
pub async fn acquire_token(provider: &dyn CredentialProvider) -> Result<String> {
    if let Some(token) = provider.token(AcquireMode::Cached).await? {
        return Ok(token);
    }
    info!("No valid cached Drive token, requesting a new one");
    provider
        .token(AcquireMode::Interactive)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No Drive token available"))
}

/// Asks a human for a token.
pub trait TokenPrompt: Send + Sync {
    fn prompt(&self) -> Result<Option<String>>;
}

/// Tokens kept obfuscated in the secrets table.
pub struct StoredCredentials {
    conn: Arc<Mutex<Connection>>,
    http: reqwest::Client,
    about_url: String,
    revoke_url: String,
    prompt: Option<Box<dyn TokenPrompt>>,
}

impl StoredCredentials {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        config: &Config,
        prompt: Option<Box<dyn TokenPrompt>>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            conn,
            http,
            about_url: format!("{}/about", config.drive_api_base.trim_end_matches('/')),
            revoke_url: config.revoke_url.clone(),
            prompt,
        })
    }

    fn cached(&self) -> Result<Option<String>> {
        let conn = lock_mutex(&self.conn)?;
        db::get_secret(&conn, DRIVE_TOKEN_KEY)
    }

    fn store(&self, token: &str) -> Result<()> {
        let conn = lock_mutex(&self.conn)?;
        db::set_secret(&conn, DRIVE_TOKEN_KEY, token)
    }

    fn forget(&self) -> Result<bool> {
        let conn = lock_mutex(&self.conn)?;
        db::delete_secret(&conn, DRIVE_TOKEN_KEY)
    }

    /// Asks Drive who the token belongs to. Any non-success status means the
    /// token is unusable.
    pub async fn validate(&self, token: &str) -> Result<bool> {
        let resp = self
            .http
            .get(&self.about_url)
            .bearer_auth(token)
            .query(&[("fields", "user")])
            .send()
            .await
            .context("Token validation request failed")?;
        debug!("Token validation returned HTTP {}", resp.status().as_u16());
        Ok(resp.status().is_success())
    }

    /// Stores a token given on the command line after validating it.
    pub async fn accept(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if !self.validate(token).await? {
            anyhow::bail!("Token validation failed");
        }
        self.store(token)
    }
}

#[async_trait]
impl CredentialProvider for StoredCredentials {
    async fn token(&self, mode: AcquireMode) -> Result<Option<String>> {
        match mode {
            AcquireMode::Cached => {
                let Some(token) = self.cached()? else {
                    return Ok(None);
                };
                match self.validate(&token).await {
                    Ok(true) => Ok(Some(token)),
                    Ok(false) => {
                        warn!("Cached Drive token was rejected, dropping it");
                        self.forget()?;
                        Ok(None)
                    }
                    Err(e) => {
                        warn!("Could not validate cached Drive token: {:#}", e);
                        self.forget()?;
                        Ok(None)
                    }
                }
            }
            AcquireMode::Interactive => {
                let Some(prompt) = &self.prompt else {
                    return Ok(None);
                };
                let Some(token) = prompt.prompt()?.map(|t| t.trim().to_string()) else {
                    return Ok(None);
                };
                if token.is_empty() {
                    return Ok(None);
                }
                self.accept(&token).await?;
                info!("Stored new Drive token");
                Ok(Some(token))
            }
        }
    }

    async fn invalidate(&self, token: &str) -> Result<()> {
        if self.cached()?.as_deref() == Some(token) {
            self.forget()?;
            info!("Invalidated cached Drive token");
        }
        Ok(())
    }

    async fn revoke(&self) -> Result<()> {
        let Some(token) = self.cached()? else {
            debug!("No cached Drive token to revoke");
            return Ok(());
        };

        match self
            .http
            .post(&self.revoke_url)
            .query(&[("token", token.as_str())])
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => info!("Revoked Drive token"),
            Ok(resp) => warn!(
                "Token revocation returned HTTP {}, clearing cache anyway",
                resp.status().as_u16()
            ),
            Err(e) => warn!("Token revocation failed, clearing cache anyway: {}", e),
        }

        self.forget()?;
        Ok(())
    }
}
