//! A single reqwest-backed [`LlmClient`], speaking an Anthropic-style
//! Messages API (one `system` field, a `messages` array, `max_tokens`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LlmClient, LlmError};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A concrete [`LlmClient`] over HTTP.
pub struct HttpLlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    /// Build a client for `model`, authenticating with `api_key`.
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_owned(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Override the API base URL (tests point this at a local mock server).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    async fn call(&self, system: Option<&str>, user: &str, max_tokens: u32) -> Result<String, LlmError> {
        let body = RequestBody {
            model: &self.model,
            system,
            max_tokens,
            messages: vec![Message {
                role: "user",
                content: user,
            }],
        };

        let response = self
            .http
            .post(&self.api_base)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: crate::types::truncate_chars(&body, 500),
            });
        }

        let parsed: ResponseBody = response.json().await?;
        Ok(parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_output_tokens: u32,
    ) -> Result<String, LlmError> {
        self.call(Some(system_prompt), user_prompt, max_output_tokens).await
    }

    async fn judge(&self, prompt: &str, max_output_tokens: u32) -> Result<String, LlmError> {
        self.call(None, prompt, max_output_tokens).await
    }
}

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: String,
}
