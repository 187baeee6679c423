use async_trait::async_trait;
use pa_flow::ConversationTurn;
use reqwest::Client;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::{
    BackendError, Completion, GenerationBackend, GenerationParams, GenerationRequest,
    ResponseFormat, StageOutput,
};

const SERVICE: &str = "chat completions";

/// How the endpoint expects the key
#[derive(Debug, Clone)]
pub enum ApiAuth {
    /// Azure OpenAI style `api-key` header
    ApiKey(String),
    /// `Authorization: Bearer` header
    Bearer(String),
}

/// Chat-completions endpoint (Azure OpenAI deployment or any compatible API)
pub struct ChatCompletionsBackend {
    name: String,
    client: Client,
    url: String,
    model: Option<String>,
    auth: ApiAuth,
}

impl ChatCompletionsBackend {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        model: Option<String>,
        auth: ApiAuth,
    ) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            url: url.into(),
            model,
            auth,
        }
    }

    /// Backend for an Azure OpenAI deployment
    pub fn azure(
        name: impl Into<String>,
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        api_key: impl Into<String>,
    ) -> Self {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            urlencoding::encode(deployment),
            urlencoding::encode(api_version)
        );
        Self::new(name, url, None, ApiAuth::ApiKey(api_key.into()))
    }

    fn payload(&self, request: &GenerationRequest, messages: Vec<Value>) -> Value {
        let mut payload = Map::new();
        if let Some(model) = &self.model {
            payload.insert("model".into(), json!(model));
        }
        payload.insert("messages".into(), Value::Array(messages));

        match &request.params {
            GenerationParams::Sampled {
                sampling,
                response_format,
            } => {
                payload.insert("temperature".into(), json!(sampling.temperature));
                payload.insert("max_tokens".into(), json!(sampling.max_tokens));
                payload.insert("top_p".into(), json!(sampling.top_p));
                payload.insert("frequency_penalty".into(), json!(sampling.frequency_penalty));
                payload.insert("presence_penalty".into(), json!(sampling.presence_penalty));
                if let Some(seed) = sampling.seed {
                    payload.insert("seed".into(), json!(seed));
                }
                if *response_format == ResponseFormat::JsonObject {
                    payload.insert("response_format".into(), json!({ "type": "json_object" }));
                }
            }
            GenerationParams::Reasoning {
                max_completion_tokens,
            } => {
                payload.insert(
                    "max_completion_tokens".into(),
                    json!(max_completion_tokens),
                );
            }
        }

        Value::Object(payload)
    }
}

/// Messages sent on the wire, plus the same turns with image data replaced by
/// page names for the case log
fn build_messages(request: &GenerationRequest) -> (Vec<Value>, Vec<ConversationTurn>) {
    let mut turns = Vec::new();
    if let Some(system) = &request.system_message {
        turns.push(ConversationTurn::system(system.clone()));
    }
    turns.extend(request.conversation_history.iter().cloned());

    let mut messages: Vec<Value> = turns
        .iter()
        .map(|turn| json!({ "role": turn.role, "content": turn.content }))
        .collect();

    if request.images.is_empty() {
        messages.push(json!({ "role": "user", "content": request.query }));
        turns.push(ConversationTurn::user(request.query.clone()));
    } else {
        let text_part = json!({ "type": "text", "text": request.query });

        let mut content = vec![text_part.clone()];
        content.extend(request.images.iter().map(|image| {
            json!({ "type": "image_url", "image_url": { "url": image.data_url() } })
        }));
        messages.push(json!({ "role": "user", "content": content }));

        let mut logged = vec![text_part];
        logged.extend(request.images.iter().map(|image| {
            json!({ "type": "image_url", "image_url": { "url": image.name } })
        }));
        turns.push(ConversationTurn::user(Value::Array(logged)));
    }

    (messages, turns)
}

pub(crate) fn is_context_length_error(body: &str) -> bool {
    body.contains("context_length_exceeded") || body.contains("maximum context length")
}

/// Parse a JSON reply, tolerating a surrounding markdown code fence
pub(crate) fn parse_json_reply(content: &str) -> Result<Value, serde_json::Error> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced.trim())
}

#[async_trait]
impl GenerationBackend for ChatCompletionsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: GenerationRequest) -> Result<Completion, BackendError> {
        let (messages, mut conversation) = build_messages(&request);
        let payload = self.payload(&request, messages);

        debug!(
            backend = %self.name,
            images = request.images.len(),
            "Sending chat completion request"
        );

        let builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        let builder = match &self.auth {
            ApiAuth::ApiKey(key) => builder.header("api-key", key),
            ApiAuth::Bearer(key) => builder.header("Authorization", format!("Bearer {}", key)),
        };

        let response = builder.json(&payload).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_context_length_error(&body) {
                warn!(backend = %self.name, "Prompt exceeds model context length");
                return Ok(Completion::ContextLengthExceeded);
            }
            return Err(BackendError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let response_json: Value = response.json().await?;
        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| BackendError::Decode {
                service: SERVICE,
                message: "missing choices[0].message.content".to_string(),
            })?;

        let parsed = match request.params.response_format() {
            ResponseFormat::JsonObject => {
                parse_json_reply(content).map_err(|e| BackendError::Decode {
                    service: SERVICE,
                    message: format!("reply is not valid JSON: {}", e),
                })?
            }
            ResponseFormat::Text => Value::String(content.to_string()),
        };

        conversation.push(ConversationTurn::assistant(content));

        Ok(Completion::Output(StageOutput {
            response: parsed,
            conversation,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SamplingParams;
    use crate::models::PageImage;

    #[test]
    fn json_reply_parsing_strips_code_fences() {
        let fenced = "```json\n{\"patient_name\": \"A\"}\n```";
        assert_eq!(parse_json_reply(fenced).unwrap()["patient_name"], "A");
        assert_eq!(parse_json_reply(" {\"a\": 1} ").unwrap()["a"], 1);
        assert!(parse_json_reply("not json").is_err());
    }

    #[test]
    fn context_length_errors_are_recognized() {
        assert!(is_context_length_error(
            r#"{"error":{"code":"context_length_exceeded","message":"..."}}"#
        ));
        assert!(is_context_length_error(
            "This model's maximum context length is 128000 tokens"
        ));
        assert!(!is_context_length_error("rate limit reached"));
    }

    #[test]
    fn image_data_is_sent_but_not_logged() {
        let request = GenerationRequest::new(
            "Extract the patient",
            GenerationParams::json(SamplingParams::default()),
        )
        .with_system("You extract data")
        .with_images(vec![PageImage::new("page_1.png", "AAAA")]);

        let (messages, turns) = build_messages(&request);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(
            messages[1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(turns[1].content[1]["image_url"]["url"], "page_1.png");
    }

    #[test]
    fn reasoning_payload_only_carries_completion_budget() {
        let backend = ChatCompletionsBackend::azure("o1", "https://x.openai.azure.com/", "o1", "2024-09-01-preview", "k");
        let request = GenerationRequest::new(
            "Decide",
            GenerationParams::Reasoning {
                max_completion_tokens: 15000,
            },
        );
        let (messages, _) = build_messages(&request);
        let payload = backend.payload(&request, messages);

        assert_eq!(payload["max_completion_tokens"], 15000);
        assert!(payload.get("temperature").is_none());
        assert!(payload.get("response_format").is_none());
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
        assert!(backend.url.starts_with("https://x.openai.azure.com/openai/deployments/o1/"));
    }
}
