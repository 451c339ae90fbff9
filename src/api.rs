use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::*;

use crate::connection::ConnectionConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ApiConfig {
    /// Defaults to the console's robot host and port
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PointOfInterest {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub theta: f32,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Serialize, Debug)]
struct NewPoi<'a> {
    name: &'a str,
}

#[derive(Serialize, Debug)]
struct NavigateRequest<'a> {
    target_id: &'a str,
}

/// Client for the robot's request/response endpoints.
///
/// Kept apart from the control loop, only the CLI subcommands use it.
#[derive(Debug, Clone)]
pub struct RobotApi {
    client: reqwest::Client,
    base_url: String,
}

impl RobotApi {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn from_config(api: &ApiConfig, connection: &ConnectionConfig) -> anyhow::Result<Self> {
        match &api.base_url {
            Some(base_url) => Self::new(base_url),
            None => Self::new(&default_base_url(connection)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn reset_map(&self) -> anyhow::Result<serde_json::Value> {
        debug!("requesting map reset");
        let response = self
            .client
            .post(self.url("/api/reset_map"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn list_pois(&self) -> anyhow::Result<Vec<PointOfInterest>> {
        let response = self
            .client
            .get(self.url("/api/poi"))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn add_poi(&self, name: &str) -> anyhow::Result<StatusResponse> {
        debug!(name, "saving point of interest");
        let response = self
            .client
            .post(self.url("/api/poi"))
            .json(&NewPoi { name })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn navigate(&self, target_id: &str) -> anyhow::Result<StatusResponse> {
        debug!(target_id, "requesting navigation");
        let response = self
            .client
            .post(self.url("/api/navigate"))
            .json(&NavigateRequest { target_id })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn default_base_url(connection: &ConnectionConfig) -> String {
    let scheme = if connection.secure { "https" } else { "http" };
    format!("{}://{}:{}", scheme, connection.host, connection.port)
}
