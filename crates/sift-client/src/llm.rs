use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use sift_core::error::AppError;
use sift_core::extract::ExtractionExample;
use sift_core::traits::Extractor;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// OpenAI-compatible client for the guarded extraction call.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
/// - local servers such as Ollama (`http://localhost:11434/v1`)
#[derive(Clone)]
pub struct OpenAiExtractor {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl OpenAiExtractor {
    pub fn new(api_key: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.api_key, &self.base_url, timeout)
    }

    fn build(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }
}

// ---- OpenAI API types ----

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// System prompt, one user/assistant pair per few-shot example, then the
/// raw text.
fn build_request(
    raw_text: &str,
    prompt: &str,
    examples: &[ExtractionExample],
    model: &str,
) -> ChatRequest {
    let mut messages = Vec::with_capacity(examples.len() * 2 + 2);
    messages.push(Message {
        role: "system",
        content: prompt.to_string(),
    });
    for example in examples {
        messages.push(Message {
            role: "user",
            content: example.input.clone(),
        });
        messages.push(Message {
            role: "assistant",
            content: example.output.to_string(),
        });
    }
    messages.push(Message {
        role: "user",
        content: raw_text.to_string(),
    });

    ChatRequest {
        model: model.to_string(),
        messages,
        temperature: 0.0,
        response_format: ResponseFormat {
            format_type: "json_object",
        },
    }
}

/// Map a non-success HTTP status and body to the error taxonomy.
fn error_from_status(status_code: u16, body: &str) -> AppError {
    if status_code == 429 {
        return AppError::RateLimitExceeded;
    }
    let message = serde_json::from_str::<ApiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));
    AppError::LlmError {
        message,
        status_code,
        retryable: status_code >= 500,
    }
}

/// Models occasionally wrap JSON in a Markdown fence despite `json_object`.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Pull the JSON object out of a chat completion body.
fn parse_completion(body: ChatResponse) -> Result<serde_json::Value, AppError> {
    let content = body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| AppError::LlmError {
            message: "Empty response from LLM".into(),
            status_code: 200,
            retryable: false,
        })?;

    serde_json::from_str(strip_code_fence(&content)).map_err(|e| {
        tracing::warn!(error = %e, raw = %content, "LLM returned invalid JSON");
        AppError::SerializationError(e)
    })
}

impl Extractor for OpenAiExtractor {
    async fn request(
        &self,
        raw_text: &str,
        prompt: &str,
        examples: &[ExtractionExample],
        model: &str,
    ) -> Result<serde_json::Value, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = build_request(raw_text, prompt, examples, model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status.as_u16(), &body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        parse_completion(body)
    }
}
