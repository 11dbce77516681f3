// ABOUTME: RocketChat REST calls: login and channel/group listing
// ABOUTME: Authenticated requests carry the X-Auth-Token and X-User-Id headers

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::time::Duration;

/// Credentials returned by /api/v1/login
#[derive(Clone)]
pub struct RocketAuth {
    pub user_id: String,
    pub token: String,
}

impl std::fmt::Debug for RocketAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocketAuth")
            .field("user_id", &self.user_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

pub struct RocketRest {
    base_url: String,
    http: reqwest::Client,
}

impl RocketRest {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<RocketAuth> {
        let response: Value = self
            .http
            .post(self.endpoint("/login"))
            .form(&[("user", email), ("password", password)])
            .send()
            .await
            .context("RocketChat login request failed")?
            .json()
            .await
            .context("RocketChat login returned invalid JSON")?;
        parse_login(&response).with_context(|| format!("Failed to login as {}", email))
    }

    /// `(name, id)` pairs from channels.list or groups.list
    pub async fn list(&self, auth: &RocketAuth, path: &str, field: &str) -> Result<Vec<(String, String)>> {
        let response: Value = self
            .http
            .get(self.endpoint(path))
            .header("X-Auth-Token", &auth.token)
            .header("X-User-Id", &auth.user_id)
            .send()
            .await
            .with_context(|| format!("RocketChat {} request failed", path))?
            .json()
            .await
            .with_context(|| format!("RocketChat {} returned invalid JSON", path))?;
        Ok(parse_listing(&response, field))
    }
}

pub fn parse_login(response: &Value) -> Result<RocketAuth> {
    let status = response.get("status").and_then(Value::as_str).unwrap_or("");
    if status != "success" {
        let message = response
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(status);
        bail!("login rejected: {}", message);
    }
    let user_id = response.pointer("/data/userId").and_then(Value::as_str);
    let token = response.pointer("/data/authToken").and_then(Value::as_str);
    match (user_id, token) {
        (Some(user_id), Some(token)) => Ok(RocketAuth {
            user_id: user_id.to_string(),
            token: token.to_string(),
        }),
        _ => bail!("login response is missing userId or authToken"),
    }
}

pub fn parse_listing(response: &Value, field: &str) -> Vec<(String, String)> {
    response
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let name = item.get("name")?.as_str()?;
                    let id = item.get("_id")?.as_str()?;
                    Some((name.to_string(), id.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}
