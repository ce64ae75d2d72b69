//! Bearer token verification for the management API
//!
//! A token is accepted only if it can perform a privileged call against the
//! identity service (GoTrue's admin user listing). Any failure, whether a
//! rejected key or an unreachable service, is reported as unauthorized.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AdapterError, Result};

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct GoTrueVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl GoTrueVerifier {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn admin_url(&self) -> String {
        format!("{}/auth/v1/admin/users", self.base_url)
    }
}

#[async_trait]
impl TokenVerifier for GoTrueVerifier {
    async fn verify(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .get(self.admin_url())
            .query(&[("page", "1"), ("per_page", "1")])
            .header("apikey", token)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e.without_url(), "Identity service unreachable");
                AdapterError::Unauthorized("token could not be verified".to_string())
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            debug!(status = %response.status(), "Identity service rejected token");
            Err(AdapterError::Unauthorized("token lacks administrative access".to_string()))
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    let value = header.ok_or_else(|| AdapterError::Unauthorized("missing Authorization header".to_string()))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AdapterError::Unauthorized("Authorization header must be 'Bearer <token>'".to_string()))?;
    Ok(token)
}
