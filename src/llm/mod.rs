//! Streaming chat-completion LLM Client (§4.7).
//!
//! An OpenAI-compatible HTTP/SSE client grounded on the bearer-auth,
//! header-routed request construction and the success/error status mapping
//! used by the chat-completions provider adapter this crate is grounded on,
//! simplified to this specification's needs: no tool-calling, no dual
//! API-mode support, and a "log and yield nothing" error policy instead of
//! typed error propagation, since the Orchestrator treats every LLM failure
//! as an empty response and keeps the session alive (§7 Backend policy).

pub mod sse;

use crate::config::LlmConfig;
use async_stream::stream;
use futures_util::{Stream, StreamExt};
use sse::SseLineParser;
use tracing::{debug, warn};

/// Streaming chat-completion client with per-user session continuity.
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Stream response-text deltas for one turn. Never returns an error:
    /// on any transport or backend failure the stream simply ends having
    /// yielded nothing, per §4.7 and §7's Backend policy.
    pub fn stream(
        &self,
        session_id: String,
        text: String,
        sender_name: Option<String>,
        agent_id: Option<String>,
    ) -> impl Stream<Item = String> + Send + 'static {
        let client = self.client.clone();
        let base_url = self.config.base_url.clone();
        let api_key = self.config.api_key.clone();
        let model = self.config.model.clone();
        let default_agent_id = self.config.default_agent_id.clone();

        stream! {
            let body = build_request_body(&model, &session_id, &text, sender_name.as_deref());
            let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
            let mut request = client
                .post(&url)
                .bearer_auth(&api_key)
                .json(&body);

            let effective_agent = agent_id.filter(|a| !a.is_empty() && *a != default_agent_id);
            if let Some(agent) = effective_agent.as_deref() {
                request = request.header("x-agent-id", agent);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "LLM request failed to send");
                    return;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                warn!("LLM backend returned 401 unauthorized");
                return;
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                warn!("LLM backend returned 404 not found");
                return;
            }
            if !status.is_success() {
                warn!(status = %status, "LLM backend returned an error status");
                return;
            }

            let mut byte_stream = response.bytes_stream();
            let mut parser = SseLineParser::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "LLM response stream interrupted");
                        return;
                    }
                };
                for event in parser.push(&chunk) {
                    if event.is_done() {
                        return;
                    }
                    if let Some(content) = extract_delta_content(&event.data) {
                        if !content.is_empty() {
                            yield content;
                        }
                    }
                }
            }
            if let Some(event) = parser.flush() {
                if !event.is_done() {
                    if let Some(content) = extract_delta_content(&event.data) {
                        if !content.is_empty() {
                            yield content;
                        }
                    }
                }
            }
        }
    }

    /// Send the `/new` sentinel to reset a session's backend history.
    /// Best-effort: errors are logged, never propagated.
    pub async fn reset(&self, session_id: &str, agent_id: Option<&str>) {
        self.send_sentinel(session_id, "/new", agent_id).await;
    }

    /// Send the `/compact` sentinel to summarize a session's backend
    /// history. Best-effort with a short timeout so shutdown is never
    /// blocked on backend latency (§9 open question 5).
    pub async fn compact(&self, session_id: &str, agent_id: Option<&str>) {
        let fut = self.send_sentinel(session_id, "/compact", agent_id);
        let timeout = std::time::Duration::from_secs(self.config.compact_timeout_secs);
        if tokio::time::timeout(timeout, fut).await.is_err() {
            debug!(session_id, "compact timed out; continuing shutdown");
        }
    }

    async fn send_sentinel(&self, session_id: &str, sentinel: &str, agent_id: Option<&str>) {
        let mut s = Box::pin(self.stream(
            session_id.to_string(),
            sentinel.to_string(),
            None,
            agent_id.map(str::to_string),
        ));
        while s.next().await.is_some() {}
    }
}

/// Voice-mode instruction prefix. Embedded in user content, not a system
/// role, because the backend replaces system messages (§4.7).
fn wrap_voice_instruction(text: &str) -> String {
    format!(
        "(Reply in plain spoken language only: no markdown, no lists, and match the length of your reply to the question.) {text}"
    )
}

fn build_request_body(
    model: &str,
    session_id: &str,
    text: &str,
    sender_name: Option<&str>,
) -> serde_json::Value {
    let mut message = serde_json::json!({
        "role": "user",
        "content": wrap_voice_instruction(text),
    });
    if let Some(name) = sender_name {
        if !name.is_empty() {
            message["name"] = serde_json::Value::String(sanitize_name(name));
        }
    }
    serde_json::json!({
        "model": model,
        "messages": [message],
        "stream": true,
        "user": session_id,
    })
}

/// OpenAI `name` fields must match `^[^\s<|\\/>]+$`-ish charsets in
/// practice; keep it simple and portable.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn extract_delta_content(data: &str) -> Option<String> {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "failed to parse SSE data as JSON");
            return None;
        }
    };
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> LlmConfig {
        LlmConfig {
            base_url,
            api_key: "test-key".into(),
            model: "test-model".into(),
            default_agent_id: "default".into(),
            request_timeout_secs: 5,
            compact_timeout_secs: 1,
        }
    }

    #[test]
    fn voice_instruction_is_embedded_in_user_content_not_system_role() {
        let body = build_request_body("m", "sess", "hello", None);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body["messages"][0]["content"].as_str().unwrap().contains("hello"));
        assert!(body["messages"].as_array().unwrap().len() == 1);
    }

    #[test]
    fn session_id_is_passed_as_user_field() {
        let body = build_request_body("m", "voice:g:c:u", "hi", None);
        assert_eq!(body["user"], "voice:g:c:u");
    }

    #[test]
    fn extract_delta_content_reads_choices_zero_delta_content() {
        let data = r#"{"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(extract_delta_content(data).as_deref(), Some("Hi"));
    }

    #[test]
    fn extract_delta_content_handles_garbage() {
        assert_eq!(extract_delta_content("not json"), None);
        assert_eq!(extract_delta_content("{}"), None);
    }

    #[tokio::test]
    async fn stream_extracts_deltas_and_stops_on_done() {
        let server = MockServer::start().await;
        let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi \"}}]}\n\n\
                         data: {\"choices\":[{\"delta\":{\"content\":\"there\"}}]}\n\n\
                         data: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(server.uri()));
        let deltas: Vec<String> = client
            .stream("sess1".into(), "hello".into(), None, None)
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hi ".to_string(), "there".to_string()]);
    }

    #[tokio::test]
    async fn stream_yields_nothing_on_401() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(server.uri()));
        let deltas: Vec<String> = client
            .stream("sess1".into(), "hello".into(), None, None)
            .collect()
            .await;
        assert!(deltas.is_empty());
    }

    #[tokio::test]
    async fn stream_sends_agent_header_when_non_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("x-agent-id", "custom-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("data: [DONE]\n\n", "text/event-stream"))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(server.uri()));
        let deltas: Vec<String> = client
            .stream(
                "sess1".into(),
                "hello".into(),
                None,
                Some("custom-agent".into()),
            )
            .collect()
            .await;
        assert!(deltas.is_empty());
    }
}
