//! Anthropic Messages API (§4.3). System messages are hoisted out of the
//! message list into the top-level `system` field the wire format expects;
//! everything else about dispatch stays kind-agnostic from the core's view.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;

use ferrogate_common::{CoreError, ErrorKind};
use ferrogate_protocol::{
    ChatChoice, ChatResponse, ChoiceDelta, Input, Key, KeyValue, Req, RequestKind, Resp, RespBody,
    StreamEvent, Usage,
};
use ferrogate_provider_core::adapter::{Classification, ProviderAdapter};

use crate::client::shared_client;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn api_key(key: &Key) -> Result<&str, CoreError> {
        match &key.value {
            KeyValue::Plain(s) => Ok(s.as_str()),
            KeyValue::ConfigBlob(_) => Err(CoreError::new(
                ErrorKind::AuthFailed,
                "anthropic adapter expects a plain api key, not a config blob",
            )),
        }
    }

    fn build_body(req: &Req, stream: bool) -> Result<JsonValue, CoreError> {
        let Input::Chat { messages } = &req.input else {
            return Err(CoreError::new(
                ErrorKind::InvalidRequest,
                "anthropic adapter only supports chat input",
            ));
        };

        let mut system = Vec::new();
        let mut turns = Vec::new();
        for m in messages {
            if m.role == "system" {
                system.push(m.content.clone());
            } else {
                turns.push(json!({ "role": m.role, "content": m.content }));
            }
        }

        let mut body = json!({
            "model": req.model,
            "messages": turns,
            "max_tokens": req.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        let obj = body.as_object_mut().expect("object literal");

        if !system.is_empty() {
            obj.insert("system".into(), json!(system.join("\n\n")));
        }
        if let Some(t) = req.params.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(t) = req.params.top_p {
            obj.insert("top_p".into(), json!(t));
        }
        if !req.params.stop.is_empty() {
            obj.insert("stop_sequences".into(), json!(req.params.stop));
        }
        if !req.params.tools.is_empty() {
            let tools: Vec<JsonValue> = req
                .params
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            obj.insert("tools".into(), json!(tools));
        }
        for (k, v) in &req.params.extra {
            obj.insert(k.clone(), v.clone());
        }

        Ok(body)
    }

    fn decode_message_json(wire: &[u8]) -> Result<Resp, CoreError> {
        let value: JsonValue = serde_json::from_slice(wire).map_err(|e| {
            CoreError::new(ErrorKind::ProviderUnretryable, format!("malformed anthropic response: {e}"))
        })?;

        let id = value.get("id").and_then(JsonValue::as_str).unwrap_or_default().to_string();
        let model = value.get("model").and_then(JsonValue::as_str).unwrap_or_default().to_string();

        let content = value
            .get("content")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let text: String = content
            .iter()
            .filter(|block| block.get("type").and_then(JsonValue::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = value
            .get("stop_reason")
            .and_then(JsonValue::as_str)
            .map(str::to_string);

        let usage = value.get("usage").map(|u| Usage {
            prompt_tokens: u.get("input_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
            completion_tokens: u.get("output_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
            total_tokens: u.get("input_tokens").and_then(JsonValue::as_u64).unwrap_or(0)
                + u.get("output_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
            cache_read_tokens: u
                .get("cache_read_input_tokens")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0),
            cache_write_tokens: u
                .get("cache_creation_input_tokens")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0),
            audio_tokens: 0,
            reasoning_tokens: 0,
        });

        Ok(Resp {
            id,
            model,
            created: 0,
            body: RespBody::Chat(ChatResponse {
                choices: vec![ChatChoice {
                    index: 0,
                    role: "assistant".into(),
                    content: text,
                    refusal: String::new(),
                    reasoning: String::new(),
                    tool_calls: Vec::new(),
                    finish_reason,
                }],
            }),
            usage,
            service_tier: None,
            extra: Default::default(),
        })
    }

    /// Anthropic's SSE frames carry an `event:` line naming the variant and a
    /// `data:` line with the payload; only the two that matter for text
    /// deltas are translated, the rest (`content_block_start`, `ping`, ...)
    /// fold into a heartbeat so the caller still sees liveness.
    fn decode_sse_frame(frame: &str) -> Result<Option<StreamEvent>, CoreError> {
        let mut event_name = None;
        let mut data_line = None;
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event_name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_line = Some(rest.trim().to_string());
            }
        }

        let (Some(event_name), Some(data)) = (event_name, data_line) else {
            return Ok(None);
        };

        let value: JsonValue = serde_json::from_str(&data)
            .map_err(|e| CoreError::new(ErrorKind::ProviderUnretryable, format!("malformed sse chunk: {e}")))?;

        match event_name.as_str() {
            "content_block_delta" => {
                let text = value
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Some(StreamEvent::Delta(ChoiceDelta {
                    index: 0,
                    content: Some(text),
                    ..Default::default()
                })))
            }
            "message_delta" => {
                let finish_reason = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                Ok(Some(StreamEvent::Final(ChoiceDelta {
                    index: 0,
                    finish_reason,
                    ..Default::default()
                })))
            }
            _ => Ok(None),
        }
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supports(&self, kind: RequestKind) -> bool {
        matches!(kind, RequestKind::ChatCompletion | RequestKind::ChatCompletionStream)
    }

    async fn encode_request(&self, req: &Req, _key: &Key) -> Result<Vec<u8>, CoreError> {
        let body = Self::build_body(req, req.kind.is_streaming())?;
        serde_json::to_vec(&body)
            .map_err(|e| CoreError::new(ErrorKind::InvalidRequest, format!("failed to encode request: {e}")))
    }

    async fn decode_response(&self, wire: &[u8]) -> Result<Resp, CoreError> {
        Self::decode_message_json(wire)
    }

    async fn decode_stream_chunk(&self, bytes: &[u8]) -> Result<StreamEvent, CoreError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CoreError::new(ErrorKind::ProviderUnretryable, format!("non-utf8 stream chunk: {e}")))?;
        Ok(Self::decode_sse_frame(text)?.unwrap_or(StreamEvent::Heartbeat))
    }

    fn classify(&self, http_status: u16, provider_error_body: &[u8]) -> Classification {
        let message = String::from_utf8_lossy(provider_error_body).to_string();
        match http_status {
            401 | 403 => Classification {
                retryable: false,
                kind: ErrorKind::AuthFailed,
                message,
            },
            429 => Classification {
                retryable: true,
                kind: ErrorKind::RateLimited,
                message,
            },
            500..=599 => Classification {
                retryable: true,
                kind: ErrorKind::ProviderTransport,
                message,
            },
            _ => Classification {
                retryable: false,
                kind: ErrorKind::ProviderUnretryable,
                message,
            },
        }
    }

    async fn call(&self, req: &Req, key: &Key) -> Result<Resp, CoreError> {
        let client = shared_client(None)?;
        let body = Self::build_body(req, false)?;
        let url = format!("{}/messages", self.base_url);

        let response = client
            .post(&url)
            .header("x-api-key", Self::api_key(key)?)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorKind::ProviderTransport, format!("anthropic request failed: {e}")).retryable(true))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::new(ErrorKind::ProviderTransport, format!("failed reading anthropic body: {e}")).retryable(true))?;

        if !status.is_success() {
            let classification = self.classify(status.as_u16(), &bytes);
            return Err(CoreError::new(classification.kind, classification.message)
                .status_code(status.as_u16())
                .provider_raw(String::from_utf8_lossy(&bytes).to_string())
                .retryable(classification.retryable));
        }

        Self::decode_message_json(&bytes)
    }

    async fn call_stream(
        &self,
        req: &Req,
        key: &Key,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, CoreError>>, CoreError> {
        let client = shared_client(None)?;
        let body = Self::build_body(req, true)?;
        let url = format!("{}/messages", self.base_url);
        let api_key = Self::api_key(key)?.to_string();

        let response = client
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorKind::ProviderTransport, format!("anthropic stream request failed: {e}")).retryable(true))?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await.unwrap_or_default();
            let classification = self.classify(status.as_u16(), &bytes);
            return Err(CoreError::new(classification.kind, classification.message)
                .status_code(status.as_u16())
                .provider_raw(String::from_utf8_lossy(&bytes).to_string())
                .retryable(classification.retryable));
        }

        let (tx, rx) = mpsc::channel(32);
        let name = self.name().to_string();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(CoreError::new(
                                ErrorKind::ProviderTransport,
                                format!("{name} stream read failed: {e}"),
                            )
                            .retryable(true)))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find("\n\n") {
                    let frame = buf[..pos].to_string();
                    buf.drain(..pos + 2);
                    match AnthropicAdapter::decode_sse_frame(&frame) {
                        Ok(Some(event)) => {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrogate_protocol::ChatMessage;
    use std::collections::HashMap;

    fn chat_req() -> Req {
        Req {
            request_id: ferrogate_common::RequestId::generate(),
            kind: RequestKind::ChatCompletion,
            provider: ferrogate_protocol::ProviderId::Anthropic,
            model: "claude-3-5-sonnet".into(),
            fallbacks: vec![],
            input: Input::Chat {
                messages: vec![
                    ChatMessage {
                        role: "system".into(),
                        content: "be terse".into(),
                        name: None,
                        tool_call_id: None,
                    },
                    ChatMessage {
                        role: "user".into(),
                        content: "hi".into(),
                        name: None,
                        tool_call_id: None,
                    },
                ],
            },
            params: Default::default(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn build_body_hoists_system_message_out_of_the_turn_list() {
        let body = AnthropicAdapter::build_body(&chat_req(), false).unwrap();
        assert_eq!(body["system"], json!("be terse"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], json!("user"));
    }

    #[test]
    fn build_body_defaults_max_tokens_when_unset() {
        let body = AnthropicAdapter::build_body(&chat_req(), false).unwrap();
        assert_eq!(body["max_tokens"], json!(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn decode_sse_frame_extracts_text_delta() {
        let frame = "event: content_block_delta\ndata: {\"delta\":{\"text\":\"hi\"}}";
        let event = AnthropicAdapter::decode_sse_frame(frame).unwrap().unwrap();
        match event {
            StreamEvent::Delta(d) => assert_eq!(d.content, Some("hi".to_string())),
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn decode_sse_frame_extracts_finish_reason_from_message_delta() {
        let frame = "event: message_delta\ndata: {\"delta\":{\"stop_reason\":\"end_turn\"}}";
        let event = AnthropicAdapter::decode_sse_frame(frame).unwrap().unwrap();
        match event {
            StreamEvent::Final(d) => assert_eq!(d.finish_reason, Some("end_turn".to_string())),
            _ => panic!("expected final"),
        }
    }

    #[test]
    fn decode_message_json_joins_text_blocks_and_maps_usage() {
        let wire = br#"{
            "id": "msg_1",
            "model": "claude-3-5-sonnet",
            "content": [{"type": "text", "text": "hi there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        }"#;
        let resp = AnthropicAdapter::decode_message_json(wire).unwrap();
        let RespBody::Chat(chat) = resp.body else {
            panic!("expected chat body");
        };
        assert_eq!(chat.choices[0].content, "hi there");
        assert_eq!(chat.choices[0].finish_reason, Some("end_turn".to_string()));
        assert_eq!(resp.usage.unwrap().total_tokens, 14);
    }
}
