// Prompt text for a generation request: typed by the user, or written by a local LLM from the character sheet.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{characters::Character, config::LlmConfig, utils::trim_string};

const SYSTEM_PROMPT: &str = include_str!("../prompt-system.tmpl");

#[derive(Clone, Debug, PartialEq)]
pub enum PromptMode {
    /// Used verbatim.
    Manual(String),
    /// Written from the character sheet alone.
    Auto,
    /// Written from the character sheet around the user's idea.
    Enhanced(String),
}

/// The instruction sent to the LLM for the auto and enhanced modes.
pub fn instruction(character: &Character, user_input: Option<&str>) -> Result<String> {
    let physical = character.physical();
    match user_input {
        None => Ok(format!(
            "Generate a descriptive text-to-image prompt for the character {}.\n\
             Physical Description: {}\n\
             Personality and Style: {}\n",
            character.name, physical, character.personality
        )),
        Some(input) if input.trim().is_empty() => {
            bail!("enhanced generation needs some input from the user")
        }
        Some(input) => Ok(format!(
            "Use the following information to generate an optimized prompt for the character {}:\n\
             Physical Description: {}\n\
             Personality and Style: {}\n\
             User's Input: {}\n",
            character.name,
            physical,
            character.personality,
            input.trim()
        )),
    }
}

/// Anything that turns an instruction into prompt text.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, instruction: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// Joins the `response` fields of a newline-delimited reply, up to the chunk marked `done`.
pub fn collect_response(body: &str) -> Result<String> {
    let mut text = String::new();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let chunk: GenerateChunk = serde_json::from_str(line)
            .with_context(|| format!("bad response line {:?}", trim_string(line, 80)))?;
        text.push_str(&chunk.response);
        if chunk.done {
            break;
        }
    }
    let text = text.trim();
    if text.is_empty() {
        bail!("the LLM returned an empty prompt");
    }
    Ok(text.to_string())
}

/// An Ollama-style `/api/generate` endpoint.
#[derive(Clone, Debug)]
pub struct OllamaClient {
    http: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.url.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl Completion for OllamaClient {
    async fn complete(&self, instruction: &str) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: instruction,
            system: SYSTEM_PROMPT,
        };
        debug!("Asking {} for a prompt", self.model);
        let body = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("LLM request failed")?
            .error_for_status()
            .context("LLM request failed")?
            .text()
            .await
            .context("failed to read LLM response")?;
        let prompt = collect_response(&body)?;
        info!("LLM wrote: {}", trim_string(&prompt, 120));
        Ok(prompt)
    }
}

/// Resolves the prompt text for a request.
pub async fn resolve(mode: &PromptMode, character: &Character, llm: &dyn Completion) -> Result<String> {
    match mode {
        PromptMode::Manual(text) => {
            let text = text.trim();
            if text.is_empty() {
                bail!("the prompt is empty");
            }
            Ok(text.to_string())
        }
        PromptMode::Auto => llm.complete(&instruction(character, None)?).await,
        PromptMode::Enhanced(input) => llm.complete(&instruction(character, Some(input))?).await,
    }
}
