// The HTTP and websocket client for a ComfyUI server.

use anyhow::{bail, Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite as ws;
use tungstenite::Message;

use crate::{
    config::BackendConfig,
    dispatcher::{Backend, EventStream, HistoryEntry, ImageRef, ServerEvent},
    utils::trim_string,
    workflow::Workflow,
};

#[derive(Clone, Debug)]
pub struct ComfyClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
}

#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    prompt: &'a Workflow,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    #[serde(default)]
    prompt_id: Option<String>,
}

impl ComfyClient {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ws_url: config.ws_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ws_endpoint(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={}", self.ws_url, client_id)
    }
}

#[async_trait]
impl Backend for ComfyClient {
    async fn listen(&self, client_id: &str) -> Result<EventStream> {
        let url = self.ws_endpoint(client_id);
        let (mut socket, _) = ws::connect_async(&url)
            .await
            .with_context(|| format!("failed to connect to {}", url))?;
        debug!("Listening on {}", url);
        let events = stream! {
            while let Some(message) = socket.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerEvent::parse(&text) {
                        Ok(event) => yield Ok(event),
                        Err(e) => debug!("Ignoring message {:?}: {:#}", trim_string(&text, 80), e),
                    },
                    // Binary messages are previews.
                    Ok(Message::Binary(data)) => trace!("Ignoring {} byte binary message", data.len()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(anyhow::Error::new(e).context("websocket error"));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(events.fuse()))
    }

    async fn submit(&self, workflow: &Workflow, client_id: &str) -> Result<Option<String>> {
        let request = PromptRequest {
            prompt: workflow,
            client_id,
        };
        let response = self
            .http
            .post(self.url("/prompt"))
            .json(&request)
            .send()
            .await
            .context("failed to send workflow")?;
        let status = response.status();
        let text = response.text().await.context("failed to read response")?;
        trace!("Response: {}", text);
        if !status.is_success() {
            bail!("backend rejected the workflow ({}): {}", status, trim_string(&text, 500));
        }
        let parsed: PromptResponse =
            serde_json::from_str(&text).context("failed to parse response")?;
        Ok(parsed.prompt_id)
    }

    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>> {
        let history: Value = self
            .http
            .get(self.url(&format!("/history/{}", prompt_id)))
            .send()
            .await
            .context("failed to fetch history")?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse history")?;
        let Some(entry) = history.get(prompt_id) else {
            return Ok(None);
        };
        let entry = serde_json::from_value(entry.clone()).context("malformed history entry")?;
        Ok(Some(entry))
    }

    async fn view(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(self.url("/view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.folder_type.as_str()),
            ])
            .send()
            .await
            .context("failed to request image")?
            .error_for_status()?
            .bytes()
            .await
            .context("failed to read image")?;
        Ok(bytes.to_vec())
    }
}
