//! Roster HTTP client
//!
//! Marks the local user live or stopped on the control plane and lists who is
//! currently live. Independent of the negotiation pipeline.

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RosterConfig;
use crate::{Error, Result};

const STREAM_STARTED: &str = "Streaming started.";
const STREAM_STOPPED: &str = "Streaming stopped.";

/// A user currently marked live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUser {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub name: String,
}

/// Ids are free-form user input, so the server may echo them back as numbers.
fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

#[derive(Serialize)]
struct StartStreamRequest<'a> {
    name: &'a str,
    id: &'a str,
}

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    message: String,
}

pub struct RosterClient {
    client: Client,
    base_url: Url,
}

impl RosterClient {
    pub fn new(config: &RosterConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid roster base url: {e}")))?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("invalid roster endpoint '{path}': {e}")))
    }

    /// Mark the user live. Returns `false` when the server reports a stream
    /// already running.
    pub async fn start_stream(&self, name: &str, id: &str) -> Result<bool> {
        let response: MessageResponse = self
            .client
            .post(self.endpoint("start-stream")?)
            .json(&StartStreamRequest { name, id })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.message == STREAM_STARTED {
            info!(user_id = %id, name = %name, "Marked live on roster");
            Ok(true)
        } else {
            warn!(user_id = %id, message = %response.message, "Stream already running");
            Ok(false)
        }
    }

    /// Mark the stream stopped. Returns `false` when there was nothing to stop.
    pub async fn stop_stream(&self) -> Result<bool> {
        let response: MessageResponse = self
            .client
            .get(self.endpoint("stop-stream")?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let stopped = response.message == STREAM_STOPPED;
        if stopped {
            info!("Marked stopped on roster");
        } else {
            warn!(message = %response.message, "No stream to stop");
        }
        Ok(stopped)
    }

    pub async fn live_users(&self) -> Result<Vec<LiveUser>> {
        let users: Vec<LiveUser> = self
            .client
            .get(self.endpoint("live-users")?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(count = users.len(), "Fetched live users");
        Ok(users)
    }
}
