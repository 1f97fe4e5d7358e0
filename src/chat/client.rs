//! Gemini `generateContent` client for text turns.

use std::time::{Duration, Instant};
use thiserror::Error;

use super::{Message, Role, SearchSource};
use crate::config::ChatConfig;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gemini API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no API key configured")]
    MissingApiKey,
}

/// Per-request switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationOptions {
    /// Ground the answer with Google Search.
    pub use_search: bool,
    /// Raise temperature and allow a thinking budget.
    pub use_deep_thinking: bool,
}

/// Answer text plus the web pages it was grounded on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    pub sources: Vec<SearchSource>,
}

pub struct ChatClient {
    api_key: String,
    model: String,
    endpoint: String,
    system_prompt: String,
    thinking_budget: u32,
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new(api_key: impl Into<String>, config: &ChatConfig) -> Result<Self, ChatError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ChatError::MissingApiKey);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            api_key,
            model: config.model.clone(),
            endpoint: format!(
                "{}/v1beta/models/{}:generateContent",
                config.base_url.trim_end_matches('/'),
                config.model
            ),
            system_prompt: config.system_prompt.clone(),
            thinking_budget: config.thinking_budget,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Build the `generateContent` payload for `messages`.
    pub fn build_request(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                    Role::System => return None,
                };
                let mut parts = vec![serde_json::json!({ "text": msg.content })];
                if msg.role == Role::User {
                    if let Some(attachment) = &msg.attachment {
                        let (mime_type, data) = split_attachment(attachment);
                        parts.push(serde_json::json!({
                            "inlineData": { "mimeType": mime_type, "data": data }
                        }));
                    }
                }
                Some(serde_json::json!({ "role": role, "parts": parts }))
            })
            .collect();

        let temperature = if options.use_deep_thinking { 1.0 } else { 0.7 };
        let mut generation_config = serde_json::json!({ "temperature": temperature });
        if options.use_deep_thinking {
            generation_config["thinkingConfig"] =
                serde_json::json!({ "thinkingBudget": self.thinking_budget });
        }

        let mut payload = serde_json::json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if !self.system_prompt.is_empty() {
            payload["systemInstruction"] =
                serde_json::json!({ "parts": [{ "text": self.system_prompt }] });
        }
        if options.use_search {
            payload["tools"] = serde_json::json!([{ "googleSearch": {} }]);
        }
        payload
    }

    /// Send the conversation and return the model's answer.
    pub async fn send_message(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<ChatReply, ChatError> {
        let start = Instant::now();
        let payload = self.build_request(messages, options);

        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let resp = self.client.post(&url).json(&payload).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status,
                message: api_error_message(&body),
            });
        }

        let body: serde_json::Value = resp.json().await?;
        let reply = parse_reply(&body);
        tracing::info!(
            model = %self.model,
            messages = messages.len(),
            search = options.use_search,
            thinking = options.use_deep_thinking,
            sources = reply.sources.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat reply received"
        );
        Ok(reply)
    }
}

/// Split a `data:<mime>;base64,<data>` URL; bare base64 is taken as JPEG.
fn split_attachment(attachment: &str) -> (&str, &str) {
    attachment
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .unwrap_or(("image/jpeg", attachment))
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// Text of the first candidate (thought parts skipped) and its web sources.
pub fn parse_reply(body: &serde_json::Value) -> ChatReply {
    let candidate = &body["candidates"][0];

    let text = candidate
        .pointer("/content/parts")
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("thought").and_then(|t| t.as_bool()) != Some(true))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default();

    let sources = candidate
        .pointer("/groundingMetadata/groundingChunks")
        .and_then(|v| v.as_array())
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| chunk.get("web"))
                .map(|web| SearchSource {
                    title: web["title"].as_str().unwrap_or_default().to_string(),
                    uri: web["uri"].as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    ChatReply { text, sources }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatSession, ERROR_REPLY};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> ChatConfig {
        ChatConfig {
            model: "gemini-test".into(),
            base_url: base_url.into(),
            ..ChatConfig::default()
        }
    }

    fn client() -> ChatClient {
        ChatClient::new("k", &config("http://localhost")).unwrap()
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            ChatClient::new("  ", &ChatConfig::default()),
            Err(ChatError::MissingApiKey)
        ));
    }

    #[test]
    fn request_maps_roles_and_skips_system() {
        let messages = vec![
            Message::new(Role::System, "ignored"),
            Message::user("Γεια"),
            Message::assistant("Γεια σου!"),
        ];
        let req = client().build_request(&messages, &GenerationOptions::default());

        let contents = req["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "Γεια σου!");
        assert_eq!(req["generationConfig"]["temperature"], 0.7);
        assert!(req["generationConfig"].get("thinkingConfig").is_none());
        assert!(req.get("tools").is_none());
        assert!(req["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("Bill"));
    }

    #[test]
    fn search_and_thinking_options_shape_request() {
        let options = GenerationOptions {
            use_search: true,
            use_deep_thinking: true,
        };
        let req = client().build_request(&[Message::user("q")], &options);
        assert_eq!(req["generationConfig"]["temperature"], 1.0);
        assert_eq!(req["generationConfig"]["thinkingConfig"]["thinkingBudget"], 4000);
        assert!(req["tools"][0]["googleSearch"].is_object());
    }

    #[test]
    fn attachment_becomes_inline_data() {
        let messages = vec![
            Message::user("what is this?").with_attachment("data:image/png;base64,iVBORw0KGgo="),
            Message::user("and this?").with_attachment("/9j/4AAQ"),
        ];
        let req = client().build_request(&messages, &GenerationOptions::default());
        let first = &req["contents"][0]["parts"][1]["inlineData"];
        assert_eq!(first["mimeType"], "image/png");
        assert_eq!(first["data"], "iVBORw0KGgo=");
        let second = &req["contents"][1]["parts"][1]["inlineData"];
        assert_eq!(second["mimeType"], "image/jpeg");
        assert_eq!(second["data"], "/9j/4AAQ");
    }

    #[test]
    fn reply_skips_thoughts_and_non_web_chunks() {
        let body = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "thinking...", "thought": true },
                    { "text": "Η Αθήνα " },
                    { "text": "έχει ήλιο." }
                ]},
                "groundingMetadata": { "groundingChunks": [
                    { "web": { "title": "meteo.gr", "uri": "https://meteo.gr" } },
                    { "retrievedContext": { "uri": "gs://x" } }
                ]}
            }]
        });
        let reply = parse_reply(&body);
        assert_eq!(reply.text, "Η Αθήνα έχει ήλιο.");
        assert_eq!(
            reply.sources,
            vec![SearchSource {
                title: "meteo.gr".into(),
                uri: "https://meteo.gr".into()
            }]
        );
        assert_eq!(parse_reply(&serde_json::json!({})), ChatReply::default());
    }

    #[tokio::test]
    async fn send_message_posts_to_generate_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-test:generateContent"))
            .and(query_param("key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "Hello from Bill" }] },
                    "groundingMetadata": { "groundingChunks": [
                        { "web": { "title": "Example", "uri": "https://example.com" } }
                    ]}
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new("secret", &config(&server.uri())).unwrap();
        let options = GenerationOptions {
            use_search: true,
            use_deep_thinking: false,
        };
        let reply = client
            .send_message(&[Message::user("hi")], &options)
            .await
            .unwrap();

        assert_eq!(reply.text, "Hello from Bill");
        assert_eq!(reply.sources[0].uri, "https://example.com");

        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["contents"][0]["parts"][0]["text"], "hi");
        assert!(sent["tools"][0]["googleSearch"].is_object());
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": { "code": 403, "message": "API key not valid" }
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new("bad", &config(&server.uri())).unwrap();
        let err = client
            .send_message(&[Message::user("hi")], &GenerationOptions::default())
            .await
            .unwrap_err();
        match err {
            ChatError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "API key not valid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failed_exchange_appends_error_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = ChatClient::new("k", &config(&server.uri())).unwrap();
        let mut session = ChatSession::new();
        let err = session
            .exchange(&client, Message::user("hi"), &GenerationOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::Api { status: 500, ref message } if message == "boom"));
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, ERROR_REPLY);
        assert_eq!(session.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn exchange_records_reply_with_sources() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "answer" }] },
                    "groundingMetadata": { "groundingChunks": [
                        { "web": { "title": "Src", "uri": "https://src" } }
                    ]}
                }]
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new("k", &config(&server.uri())).unwrap();
        let mut session = ChatSession::new();
        session
            .exchange(&client, Message::user("first"), &GenerationOptions::default())
            .await
            .unwrap();
        let reply = session
            .exchange(&client, Message::user("second"), &GenerationOptions::default())
            .await
            .unwrap();

        assert_eq!(reply.content, "answer");
        assert_eq!(reply.sources.len(), 1);
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.title, "first");

        let requests = server.received_requests().await.unwrap();
        let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(second["contents"].as_array().unwrap().len(), 3);
    }
}
