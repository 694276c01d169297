//! Model client for an HTTP generate endpoint.
//!
//! Speaks the common `POST {base_url}/api/generate` shape:
//! `{model, prompt, images?, stream: false}` in, `{response}` out. Used both
//! as page analyzer (image in the request) and as model invoker.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::template::render_report;
use super::{DocumentText, ModelCatalog, ModelInvoker, PageAnalysis, PageAnalyzer, Synthesis};
use crate::error::CapabilityError;

const PAGE_PROMPT: &str = "Extract all text from this image. Provide only the extracted text.";

/// The endpoint reports no confidence for generated text.
const GENERATED_TEXT_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct HttpModelConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub api_key: Option<SecretString>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct HttpModelClient {
    client: Client,
    config: HttpModelConfig,
    catalog: ModelCatalog,
}

impl HttpModelClient {
    pub fn new(config: HttpModelConfig, catalog: ModelCatalog) -> Result<Self, CapabilityError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| CapabilityError::permanent(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            catalog,
        })
    }

    fn generate(
        &self,
        model_id: &str,
        prompt: String,
        images: Vec<String>,
    ) -> Result<String, CapabilityError> {
        let model = self.catalog.require(model_id)?;
        let url = format!("{}/api/generate", self.config.base_url.trim_end_matches('/'));

        let mut request = self.client.post(&url).json(&GenerateRequest {
            model,
            prompt,
            images,
            stream: false,
        });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().map_err(classify_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| CapabilityError::permanent(format!("Failed to parse response: {}", e)))?;
        Ok(parsed.response)
    }
}

fn classify_transport_error(e: reqwest::Error) -> CapabilityError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        CapabilityError::transient(format!("Generation request failed: {}", e))
    } else {
        CapabilityError::permanent(format!("Generation request failed: {}", e))
    }
}

/// 5xx and 429 are worth retrying, other client errors are not.
fn classify_status(status: StatusCode, body: &str) -> CapabilityError {
    let message = format!("Generation failed: HTTP {} - {}", status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        CapabilityError::Transient(message)
    } else {
        CapabilityError::Permanent(message)
    }
}

impl PageAnalyzer for HttpModelClient {
    fn analyze(&self, image: &[u8], model_id: &str) -> Result<PageAnalysis, CapabilityError> {
        let _span = tracing::info_span!("capability.page_analysis", model = model_id).entered();
        let text = self.generate(model_id, PAGE_PROMPT.to_string(), vec![BASE64.encode(image)])?;
        if text.trim().is_empty() {
            return Err(CapabilityError::permanent("Model returned no text for page"));
        }
        Ok(PageAnalysis {
            text,
            confidence: GENERATED_TEXT_CONFIDENCE,
        })
    }
}

impl ModelInvoker for HttpModelClient {
    fn synthesize(
        &self,
        document: &DocumentText,
        model_id: &str,
    ) -> Result<Synthesis, CapabilityError> {
        let _span = tracing::info_span!("capability.synthesis", model = model_id).entered();
        let prompt = format!(
            "Write a short overview of the following document of {} pages. \
             Reply with the overview only.\n\n{}",
            document.page_count(),
            document.plain_text()
        );
        let overview = self.generate(model_id, prompt, Vec::new())?;
        Ok(Synthesis {
            markdown_content: render_report(&overview, document),
            document_overview: overview.trim().to_string(),
        })
    }
}
