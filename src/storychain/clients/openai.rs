//! The `OpenAIClient` struct implements `ClientWrapper` for OpenAI's Chat Completions API,
//! streaming replies as server-sent events.
//!
//! The model, token limit and sampling settings travel with every request in
//! [`GenerationParameters`], so one client can serve every agent of a pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use storychain::client_wrapper::{ClientWrapper, GenerationParameters, Message, Role};
//! use storychain::clients::openai::OpenAIClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let client = OpenAIClient::new(&std::env::var("OPENAI_API_KEY")?)?;
//!     let messages = vec![
//!         Message::with_role(Role::System, "You are an assistant."),
//!         Message::with_role(Role::User, "Hello!"),
//!     ];
//!     let parameters = GenerationParameters::new("gpt-4", 256).with_temperature(0.3);
//!
//!     let mut stream = client.send_message_stream(&messages, &parameters).await?;
//!     while let Some(chunk) = stream.next().await {
//!         print!("{}", chunk?.content);
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::sync::RwLock;

use crate::storychain::client_wrapper::{
    ClientWrapper, GenerationParameters, Message, MessageChunkStream, SendError,
};
use crate::storychain::clients::common::{chunk_stream, ChatRequest, StreamError};
use crate::storychain::clients::http_pool::shared_http_client;

/// Default endpoint for the public OpenAI API.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Client wrapper for OpenAI's Chat Completions API, or any endpoint speaking the same protocol.
pub struct OpenAIClient {
    http: reqwest::Client,
    base_url: String,
    /// Replaceable at runtime through [`OpenAIClient::set_api_key`].
    api_key: RwLock<String>,
}

impl OpenAIClient {
    /// Construct a client for the public OpenAI endpoint.
    pub fn new(api_key: &str) -> Result<Self, SendError> {
        Self::new_with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Construct a client targeting a custom OpenAI compatible base URL.
    pub fn new_with_base_url(api_key: &str, base_url: &str) -> Result<Self, SendError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = shared_http_client(&base_url)?;
        Ok(OpenAIClient {
            http,
            base_url,
            api_key: RwLock::new(api_key.to_string()),
        })
    }

    /// Replace the credential used by subsequent requests.
    pub fn set_api_key(&self, api_key: &str) {
        let mut key = match self.api_key.write() {
            Ok(key) => key,
            Err(poisoned) => poisoned.into_inner(),
        };
        *key = api_key.to_string();
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> String {
        match self.api_key.read() {
            Ok(key) => key.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn send_message_stream(
        &self,
        messages: &[Message],
        parameters: &GenerationParameters,
    ) -> Result<MessageChunkStream, SendError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest::streaming(messages, parameters);

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key())
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                log::error!(
                    "OpenAIClient::send_message_stream(...): request to {} failed: {}",
                    url,
                    err
                );
                Box::new(err) as SendError
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            log::error!(
                "OpenAIClient::send_message_stream(...): OpenAI API Error {}: {}",
                status,
                detail
            );
            return Err(Box::new(StreamError(format!(
                "OpenAI API returned {}: {}",
                status, detail
            ))));
        }

        log::debug!(
            "OpenAIClient::send_message_stream(...): streaming {} with {} messages",
            parameters.model,
            messages.len()
        );
        Ok(chunk_stream(response.bytes_stream()))
    }
}
