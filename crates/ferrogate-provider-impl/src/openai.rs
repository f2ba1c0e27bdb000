//! OpenAI-compatible chat completions (§4.3). Also the adapter any
//! `CustomProviderConfig { base_provider: "openai", .. }` entry resolves to,
//! just pointed at a different `base_url`.

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    base_url: String,
}

impl OpenAiAdapter {
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
                "openai adapter expects a plain bearer key, not a config blob",
            )),
        }
    }

    fn endpoint(&self, kind: RequestKind) -> &'static str {
        match kind {
            RequestKind::ChatCompletion | RequestKind::ChatCompletionStream => "/chat/completions",
            _ => "/chat/completions",
        }
    }

    fn build_body(req: &Req, stream: bool) -> Result<JsonValue, CoreError> {
        let Input::Chat { messages } = &req.input else {
            return Err(CoreError::new(
                ErrorKind::InvalidRequest,
                "openai adapter only supports chat input",
            ));
        };

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().expect("object literal");

        if let Some(t) = req.params.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(t) = req.params.top_p {
            obj.insert("top_p".into(), json!(t));
        }
        if let Some(t) = req.params.max_tokens {
            obj.insert("max_tokens".into(), json!(t));
        }
        if !req.params.stop.is_empty() {
            obj.insert("stop".into(), json!(req.params.stop));
        }
        if let Some(p) = req.params.presence_penalty {
            obj.insert("presence_penalty".into(), json!(p));
        }
        if let Some(p) = req.params.frequency_penalty {
            obj.insert("frequency_penalty".into(), json!(p));
        }
        if !req.params.tools.is_empty() {
            let tools: Vec<JsonValue> = req
                .params
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), json!(tools));
        }
        if let Some(tc) = &req.params.tool_choice {
            obj.insert("tool_choice".into(), tc.clone());
        }
        for (k, v) in &req.params.extra {
            obj.insert(k.clone(), v.clone());
        }

        Ok(body)
    }

    fn decode_chat_json(wire: &[u8]) -> Result<Resp, CoreError> {
        let value: JsonValue = serde_json::from_slice(wire)
            .map_err(|e| CoreError::new(ErrorKind::ProviderUnretryable, format!("malformed openai response: {e}")))?;

        let id = value
            .get("id")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let model = value
            .get("model")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let created = value.get("created").and_then(JsonValue::as_i64).unwrap_or(0);

        let choices = value
            .get("choices")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|c| {
                let message = c.get("message").cloned().unwrap_or(JsonValue::Null);
                ChatChoice {
                    index: c.get("index").and_then(JsonValue::as_u64).unwrap_or(0) as u32,
                    role: message
                        .get("role")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("assistant")
                        .to_string(),
                    content: message
                        .get("content")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    refusal: message
                        .get("refusal")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    reasoning: String::new(),
                    tool_calls: Vec::new(),
                    finish_reason: c
                        .get("finish_reason")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                }
            })
            .collect();

        let usage = value.get("usage").map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
            completion_tokens: u.get("completion_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
            total_tokens: u.get("total_tokens").and_then(JsonValue::as_u64).unwrap_or(0),
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            audio_tokens: 0,
            reasoning_tokens: 0,
        });

        Ok(Resp {
            id,
            model,
            created,
            body: RespBody::Chat(ChatResponse { choices }),
            usage,
            service_tier: value
                .get("service_tier")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            extra: Default::default(),
        })
    }

    fn decode_sse_line(line: &str) -> Result<Option<StreamEvent>, CoreError> {
        let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
            return Ok(None);
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(None);
        }
        if payload.is_empty() {
            return Ok(None);
        }

        let value: JsonValue = serde_json::from_str(payload)
            .map_err(|e| CoreError::new(ErrorKind::ProviderUnretryable, format!("malformed sse chunk: {e}")))?;

        let choice = value
            .get("choices")
            .and_then(JsonValue::as_array)
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(JsonValue::Null);
        let delta = choice.get("delta").cloned().unwrap_or(JsonValue::Null);
        let finish_reason = choice
            .get("finish_reason")
            .and_then(JsonValue::as_str)
            .map(str::to_string);

        let choice_delta = ChoiceDelta {
            index: choice.get("index").and_then(JsonValue::as_u64).unwrap_or(0) as u32,
            role: delta.get("role").and_then(JsonValue::as_str).map(str::to_string),
            content: delta.get("content").and_then(JsonValue::as_str).map(str::to_string),
            refusal: delta.get("refusal").and_then(JsonValue::as_str).map(str::to_string),
            finish_reason: finish_reason.clone(),
            ..Default::default()
        };

        if finish_reason.is_some() {
            Ok(Some(StreamEvent::Final(choice_delta)))
        } else {
            Ok(Some(StreamEvent::Delta(choice_delta)))
        }
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
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
        Self::decode_chat_json(wire)
    }

    async fn decode_stream_chunk(&self, bytes: &[u8]) -> Result<StreamEvent, CoreError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CoreError::new(ErrorKind::ProviderUnretryable, format!("non-utf8 stream chunk: {e}")))?;
        for line in text.lines() {
            if let Some(event) = Self::decode_sse_line(line)? {
                return Ok(event);
            }
        }
        Ok(StreamEvent::Heartbeat)
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
        let url = format!("{}{}", self.base_url, self.endpoint(req.kind));

        let response = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", Self::api_key(key)?))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorKind::ProviderTransport, format!("openai request failed: {e}")).retryable(true))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::new(ErrorKind::ProviderTransport, format!("failed reading openai body: {e}")).retryable(true))?;

        if !status.is_success() {
            let classification = self.classify(status.as_u16(), &bytes);
            return Err(CoreError::new(classification.kind, classification.message)
                .status_code(status.as_u16())
                .provider_raw(String::from_utf8_lossy(&bytes).to_string())
                .retryable(classification.retryable));
        }

        Self::decode_chat_json(&bytes)
    }

    async fn call_stream(
        &self,
        req: &Req,
        key: &Key,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, CoreError>>, CoreError> {
        let client = shared_client(None)?;
        let body = Self::build_body(req, true)?;
        let url = format!("{}{}", self.base_url, self.endpoint(req.kind));
        let api_key = Self::api_key(key)?.to_string();

        let response = client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorKind::ProviderTransport, format!("openai stream request failed: {e}")).retryable(true))?;

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
                    for line in frame.lines() {
                        match OpenAiAdapter::decode_sse_line(line) {
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

    fn chat_req(streaming: bool) -> Req {
        Req {
            request_id: ferrogate_common::RequestId::generate(),
            kind: if streaming {
                RequestKind::ChatCompletionStream
            } else {
                RequestKind::ChatCompletion
            },
            provider: ferrogate_protocol::ProviderId::OpenAI,
            model: "gpt-4o-mini".into(),
            fallbacks: vec![],
            input: Input::Chat {
                messages: vec![ChatMessage {
                    role: "user".into(),
                    content: "hi".into(),
                    name: None,
                    tool_call_id: None,
                }],
            },
            params: Default::default(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn build_body_sets_stream_flag() {
        let body = OpenAiAdapter::build_body(&chat_req(true), true).unwrap();
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["model"], json!("gpt-4o-mini"));
    }

    #[test]
    fn decode_sse_line_distinguishes_delta_from_final() {
        let delta = OpenAiAdapter::decode_sse_line(
            r#"data: {"choices":[{"index":0,"delta":{"content":"h"}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(delta, StreamEvent::Delta(_)));

        let done = OpenAiAdapter::decode_sse_line(
            r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(done, StreamEvent::Final(_)));

        assert!(OpenAiAdapter::decode_sse_line("data: [DONE]").unwrap().is_none());
    }

    #[test]
    fn classify_maps_status_codes() {
        let adapter = OpenAiAdapter::new();
        assert_eq!(adapter.classify(429, b"").kind, ErrorKind::RateLimited);
        assert!(adapter.classify(429, b"").retryable);
        assert_eq!(adapter.classify(401, b"").kind, ErrorKind::AuthFailed);
        assert!(!adapter.classify(401, b"").retryable);
        assert_eq!(adapter.classify(503, b"").kind, ErrorKind::ProviderTransport);
    }

    #[test]
    fn decode_chat_json_extracts_choice_and_usage() {
        let wire = br#"{
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "created": 1700000000,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        }"#;
        let resp = OpenAiAdapter::decode_chat_json(wire).unwrap();
        assert_eq!(resp.id, "chatcmpl-1");
        let RespBody::Chat(chat) = resp.body else {
            panic!("expected chat body");
        };
        assert_eq!(chat.choices[0].content, "hi there");
        assert_eq!(resp.usage.unwrap().total_tokens, 5);
    }
}
