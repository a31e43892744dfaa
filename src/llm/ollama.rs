use log::{debug, warn};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::llm::{LanguageModel, SamplingOptions};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: &'a SamplingOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

/// Local Ollama server.
pub struct OllamaClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(GENERATE_TIMEOUT)
            .build()
            .map_err(|e| Error::ModelUnavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        Self::new(cfg.base_url.clone(), cfg.name.clone())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn tags(&self) -> Result<TagsResponse> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .map_err(|e| Error::ModelUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::ModelUnavailable(format!("tags: {}", resp.status())));
        }
        resp.json()
            .map_err(|e| Error::MalformedResponse(e.to_string()))
    }
}

/// Substring match so "phi3:mini" finds "phi3:mini" and "phi3" finds "phi3:latest".
fn model_listed(names: &[String], model: &str) -> bool {
    names.iter().any(|name| name.contains(model))
}

impl LanguageModel for OllamaClient {
    fn health_check(&self) -> bool {
        match self.tags() {
            Ok(tags) => {
                let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
                model_listed(&names, &self.model)
            }
            Err(e) => {
                warn!("model backend health check failed: {e}");
                false
            }
        }
    }

    fn generate(&self, prompt: &str, system: &str, options: &SamplingOptions) -> Result<String> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
            options,
        };
        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .map_err(|e| Error::ModelUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::ModelUnavailable(format!("generate: {}", resp.status())));
        }

        let parsed: GenerateResponse = resp
            .json()
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        let text = parsed.response.unwrap_or_default().trim().to_string();
        if text.is_empty() {
            return Err(Error::MalformedResponse("empty completion".into()));
        }
        debug!("model returned {} chars", text.len());
        Ok(text)
    }
}
