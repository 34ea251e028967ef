use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ChatConfig;
use crate::session::{Role, Turn};

/// Why a completion produced no answer
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("could not reach chat service: {0}")]
    Transport(String),
    #[error("chat service rejected the API key ({0})")]
    Unauthorized(StatusCode),
    #[error("chat service rate limit or quota exceeded: {0}")]
    RateLimited(String),
    #[error("chat service returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("unexpected response from chat service: {0}")]
    MalformedResponse(String),
    #[error("chat service returned an empty reply")]
    EmptyResponse,
}

/// One request/response exchange with a chat model
pub trait ChatCompletion {
    fn complete(&self, credential: &str, messages: &[Turn]) -> Result<String, ChatError>;
}

/// OpenAI-compatible chat-completions client
pub struct ChatClient {
    config: ChatConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Self {
        ChatClient { config }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn send(&self, credential: &str, messages: &[Turn]) -> Result<String, ChatError> {
        validate(credential, messages)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        debug!(
            "Sending {} message(s) to {} ({})",
            messages.len(),
            self.config.endpoint,
            self.config.model
        );

        let request = ChatRequest {
            model: &self.config.model,
            messages,
        };

        let response = client
            .post(&self.config.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", credential))
            .json(&request)
            .send()
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChatError::Unauthorized(status),
                StatusCode::TOO_MANY_REQUESTS => ChatError::RateLimited(body),
                _ => ChatError::Api { status, body },
            });
        }

        let body: ChatResponse = response
            .json()
            .map_err(|e| ChatError::MalformedResponse(e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::MalformedResponse("response has no choices".to_string()))?
            .message
            .content
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ChatError::EmptyResponse);
        }
        Ok(content)
    }
}

impl ChatCompletion for ChatClient {
    fn complete(&self, credential: &str, messages: &[Turn]) -> Result<String, ChatError> {
        self.send(credential, messages).map_err(|e| {
            warn!("Chat completion failed: {}", e);
            e
        })
    }
}

fn validate(credential: &str, messages: &[Turn]) -> Result<(), ChatError> {
    if credential.trim().is_empty() {
        return Err(ChatError::InvalidRequest("API key is empty".to_string()));
    }
    match messages.last() {
        None => Err(ChatError::InvalidRequest("no messages to send".to_string())),
        Some(turn) if turn.role != Role::User => Err(ChatError::InvalidRequest(
            "conversation must end with a user turn".to_string(),
        )),
        Some(_) => Ok(()),
    }
}
