//! LLM provider trait and the three concrete HTTP providers (C7), grounded
//! on the teacher's `vault/llm.rs::OpenRouterClient` chat-completion shape:
//! one HTTP client, one JSON request/response pair, each provider pointed
//! at its own vendor endpoint and model name.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceReason {
    Timeout,
    ParseError,
    SchemaError,
    ApiError,
    MissingKey,
}

#[derive(Debug, Clone)]
pub struct ComplianceFailure {
    pub reason: ComplianceReason,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOutput {
    pub trade_score: f64,
    pub should_trade: bool,
    pub confidence: f64,
    pub rationale: String,
}

/// Raw JSON shape models are instructed to return. Anything that fails to
/// parse into this, or whose fields are out of range, is a `SchemaError`.
#[derive(Debug, Deserialize)]
struct RawModelOutput {
    trade_score: f64,
    should_trade: bool,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

fn parse_model_output(content: &str) -> Result<ModelOutput, ComplianceFailure> {
    let raw: RawModelOutput = serde_json::from_str(content.trim()).map_err(|e| ComplianceFailure {
        reason: ComplianceReason::ParseError,
        message: e.to_string(),
    })?;

    if !(0.0..=100.0).contains(&raw.trade_score) || !(0.0..=1.0).contains(&raw.confidence) {
        return Err(ComplianceFailure {
            reason: ComplianceReason::SchemaError,
            message: format!(
                "trade_score/confidence out of range: {} / {}",
                raw.trade_score, raw.confidence
            ),
        });
    }

    Ok(ModelOutput {
        trade_score: raw.trade_score,
        should_trade: raw.should_trade,
        confidence: raw.confidence,
        rationale: raw.rationale,
    })
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn evaluate(&self, prompt: &str, timeout: Duration) -> Result<ModelOutput, ComplianceFailure>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Deserialize)]
struct ChatMessageOut {
    content: String,
}

const SYSTEM_PROMPT: &str = "You are a trading-decision model. Respond with a single JSON object: \
{\"trade_score\": 0-100, \"should_trade\": bool, \"confidence\": 0-1, \"rationale\": string}. \
No prose outside the JSON.";

/// One HTTP chat-completion client shared by all three vendor providers;
/// only the endpoint, api key, and model name differ per instance.
pub struct HttpChatProvider {
    name: String,
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpChatProvider {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
        }
    }

    pub fn claude(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self::new(
            "claude",
            "https://api.anthropic.com/v1/messages",
            api_key,
            model,
        )
    }

    pub fn gpt4o(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self::new(
            "gpt4o",
            "https://api.openai.com/v1/chat/completions",
            api_key,
            model,
        )
    }

    pub fn gemini(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self::new(
            "gemini",
            "https://generativelanguage.googleapis.com/v1beta/chat/completions",
            api_key,
            model,
        )
    }
}

#[async_trait]
impl ModelProvider for HttpChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, prompt: &str, timeout: Duration) -> Result<ModelOutput, ComplianceFailure> {
        let api_key = self.api_key.as_ref().ok_or_else(|| ComplianceFailure {
            reason: ComplianceReason::MissingKey,
            message: format!("{} api key not configured", self.name),
        })?;

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: 512,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(timeout)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ComplianceFailure {
                        reason: ComplianceReason::Timeout,
                        message: e.to_string(),
                    }
                } else {
                    ComplianceFailure {
                        reason: ComplianceReason::ApiError,
                        message: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(ComplianceFailure {
                reason: ComplianceReason::ApiError,
                message: format!("http {}", response.status()),
            });
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| ComplianceFailure {
            reason: ComplianceReason::ParseError,
            message: e.to_string(),
        })?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| ComplianceFailure {
                reason: ComplianceReason::ParseError,
                message: "no choices in response".into(),
            })?;

        parse_model_output(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_json_parses() {
        let output = parse_model_output(
            r#"{"trade_score": 72.5, "should_trade": true, "confidence": 0.8, "rationale": "momentum"}"#,
        )
        .unwrap();
        assert_eq!(output.trade_score, 72.5);
        assert!(output.should_trade);
    }

    #[test]
    fn out_of_range_score_is_schema_error() {
        let result = parse_model_output(
            r#"{"trade_score": 150, "should_trade": true, "confidence": 0.8, "rationale": "x"}"#,
        );
        assert!(matches!(
            result,
            Err(ComplianceFailure {
                reason: ComplianceReason::SchemaError,
                ..
            })
        ));
    }

    #[test]
    fn garbage_content_is_parse_error() {
        let result = parse_model_output("not json at all");
        assert!(matches!(
            result,
            Err(ComplianceFailure {
                reason: ComplianceReason::ParseError,
                ..
            })
        ));
    }
}
