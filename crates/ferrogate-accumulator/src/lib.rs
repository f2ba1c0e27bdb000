//! Streaming Accumulator (C8): stateful online reconstruction of a complete
//! `Resp` from a sequence of provider-agnostic `StreamEvent` deltas.
//!
//! Modeled directly on the `BTreeMap<u32, ChoiceState>` push_event/finalize
//! state machines once used for per-provider stream-to-message reconstruction,
//! generalized to a single provider-agnostic `StreamEvent` instead of one
//! state machine per wire format.

use std::collections::BTreeMap;
use std::time::Instant;

use ferrogate_protocol::{
    AudioDelta, ChatChoice, ChatResponse, ChoiceDelta, ExtraFields, Resp, RespBody, StreamEvent,
    ToolCall, Usage,
};

#[derive(Debug, Clone, Default)]
struct ToolCallState {
    id: Option<String>,
    call_type: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Clone, Default)]
struct AudioState {
    id: Option<String>,
    data: String,
    transcript: String,
    expires_at: Option<i64>,
}

#[derive(Debug, Clone)]
struct ChoiceState {
    role: Option<String>,
    content: String,
    refusal: String,
    reasoning: String,
    reasoning_details: BTreeMap<u32, (Option<String>, String)>,
    audio: Option<AudioState>,
    tool_calls: BTreeMap<u32, ToolCallState>,
    finish_reason: Option<String>,
}

impl Default for ChoiceState {
    fn default() -> Self {
        Self {
            role: None,
            content: String::new(),
            refusal: String::new(),
            reasoning: String::new(),
            reasoning_details: BTreeMap::new(),
            audio: None,
            tool_calls: BTreeMap::new(),
            finish_reason: None,
        }
    }
}

/// Per-trace accumulator (§3 "StreamAccumulator state", §4.8).
#[derive(Debug)]
pub struct StreamAccumulator {
    id: String,
    model: String,
    created: i64,
    usage: Option<Usage>,
    service_tier: Option<String>,
    choices: BTreeMap<u32, ChoiceState>,
    first_chunk_at: Option<Instant>,
    request_started_at: Instant,
}

/// Time from request start to first stream chunk, in milliseconds.
pub type TtftMs = u64;

impl StreamAccumulator {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            usage: None,
            service_tier: None,
            choices: BTreeMap::new(),
            first_chunk_at: None,
            request_started_at: Instant::now(),
        }
    }

    /// Feeds one decoded event. Returns `Some(Resp)` exactly once, on the
    /// terminal `Final` event.
    pub fn push_event(&mut self, event: StreamEvent) -> Option<Resp> {
        if self.first_chunk_at.is_none() && !matches!(event, StreamEvent::Heartbeat) {
            self.first_chunk_at = Some(Instant::now());
        }

        match event {
            StreamEvent::Heartbeat => None,
            StreamEvent::Delta(delta) => {
                self.merge_delta(delta);
                None
            }
            StreamEvent::Final(delta) => {
                self.merge_delta(delta);
                Some(self.build_response())
            }
        }
    }

    /// Synthesizes a response from whatever state has accumulated, without
    /// requiring a terminal event (explicit stream close).
    pub fn finalize(&mut self) -> Resp {
        self.build_response()
    }

    /// Synthesizes a response on cooperative cancellation: identical to
    /// `finalize` except choices with no finish reason are marked `"cancelled"`.
    pub fn finalize_on_cancel(&mut self) -> Resp {
        for state in self.choices.values_mut() {
            if state.finish_reason.is_none() {
                state.finish_reason = Some("cancelled".to_string());
            }
        }
        self.build_response()
    }

    /// `FirstChunkTime - RequestStartTime` in ms, emitted once a chunk has
    /// arrived.
    pub fn ttft_ms(&self) -> Option<TtftMs> {
        self.first_chunk_at
            .map(|at| at.saturating_duration_since(self.request_started_at).as_millis() as u64)
    }

    fn merge_delta(&mut self, delta: ChoiceDelta) {
        if let Some(usage) = &delta.usage {
            self.usage = Some(match self.usage.take() {
                Some(mut existing) => {
                    existing.merge_latest(usage.clone());
                    existing
                }
                None => usage.clone(),
            });
        }

        let state = self.choices.entry(delta.index).or_default();

        // Role is taken from the first delta that provides it; later deltas
        // repeating (or omitting) a role must not overwrite it.
        if let Some(role) = delta.role {
            state.role.get_or_insert(role);
        }
        if let Some(content) = delta.content {
            state.content.push_str(&content);
        }
        if let Some(refusal) = delta.refusal {
            state.refusal.push_str(&refusal);
        }
        if let Some(reasoning) = delta.reasoning {
            state.reasoning.push_str(&reasoning);
        }
        for detail in delta.reasoning_details {
            let entry = state
                .reasoning_details
                .entry(detail.index)
                .or_insert((None, String::new()));
            if let Some(detail_type) = detail.detail_type {
                if !detail_type.is_empty() {
                    entry.0 = Some(detail_type);
                }
            }
            if let Some(text) = detail.text {
                entry.1.push_str(&text);
            }
        }
        if let Some(audio) = delta.audio {
            merge_audio(&mut state.audio, audio);
        }
        for tool_call in delta.tool_calls {
            merge_tool_call(state, tool_call);
        }
        if let Some(reason) = delta.finish_reason {
            state.finish_reason = Some(reason);
        }
    }

    fn build_response(&self) -> Resp {
        let choices: Vec<ChatChoice> = self
            .choices
            .iter()
            .map(|(index, state)| ChatChoice {
                index: *index,
                role: state.role.clone().unwrap_or_else(|| "assistant".to_string()),
                content: state.content.clone(),
                refusal: state.refusal.clone(),
                reasoning: state.reasoning.clone(),
                tool_calls: state
                    .tool_calls
                    .iter()
                    .map(|(idx, tool)| ToolCall {
                        index: *idx,
                        id: tool.id.clone(),
                        call_type: tool.call_type.clone(),
                        name: tool.name.clone(),
                        arguments: tool.arguments.clone(),
                    })
                    .collect(),
                finish_reason: state.finish_reason.clone(),
            })
            .collect();

        Resp {
            id: self.id.clone(),
            model: self.model.clone(),
            created: self.created,
            body: RespBody::Chat(ChatResponse { choices }),
            usage: self.usage.clone(),
            service_tier: self.service_tier.clone(),
            extra: ExtraFields::default(),
        }
    }
}

fn merge_audio(target: &mut Option<AudioState>, incoming: AudioDelta) {
    let entry = target.get_or_insert_with(AudioState::default);
    if let Some(id) = incoming.id {
        if !id.is_empty() {
            entry.id = Some(id);
        }
    }
    if let Some(data) = incoming.data {
        entry.data.push_str(&data);
    }
    if let Some(transcript) = incoming.transcript {
        entry.transcript.push_str(&transcript);
    }
    if let Some(expires_at) = incoming.expires_at {
        if expires_at != 0 {
            entry.expires_at = Some(expires_at);
        }
    }
}

fn merge_tool_call(state: &mut ChoiceState, delta: ferrogate_protocol::ToolCallDelta) {
    let entry = state.tool_calls.entry(delta.index).or_default();
    if let Some(id) = delta.id {
        entry.id = Some(id);
    }
    if let Some(call_type) = delta.call_type {
        entry.call_type = Some(call_type);
    }
    if let Some(name) = delta.name {
        entry.name = Some(name);
    }
    if let Some(arguments) = delta.arguments {
        entry.arguments.push_str(&arguments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrogate_protocol::{ReasoningDetailDelta, ToolCallDelta};

    fn delta(index: u32) -> ChoiceDelta {
        ChoiceDelta {
            index,
            ..Default::default()
        }
    }

    #[test]
    fn concatenates_content_across_deltas() {
        let mut acc = StreamAccumulator::new("id", "gpt", 0);
        acc.push_event(StreamEvent::Delta(ChoiceDelta {
            content: Some("Hel".to_string()),
            role: Some("assistant".to_string()),
            ..delta(0)
        }));
        acc.push_event(StreamEvent::Delta(ChoiceDelta {
            content: Some("lo".to_string()),
            ..delta(0)
        }));
        let resp = acc.push_event(StreamEvent::Final(ChoiceDelta {
            finish_reason: Some("stop".to_string()),
            ..delta(0)
        }));

        let resp = resp.expect("final event must synthesize a response");
        match resp.body {
            RespBody::Chat(chat) => {
                assert_eq!(chat.choices.len(), 1);
                assert_eq!(chat.choices[0].content, "Hello");
                assert_eq!(chat.choices[0].finish_reason.as_deref(), Some("stop"));
            }
            _ => panic!("expected chat response"),
        }
    }

    #[test]
    fn merges_tool_calls_and_reasoning_details_by_index() {
        let mut acc = StreamAccumulator::new("id", "gpt", 0);
        acc.push_event(StreamEvent::Delta(ChoiceDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("call_1".to_string()),
                name: Some("search".to_string()),
                arguments: Some("{\"q\":".to_string()),
                ..Default::default()
            }],
            reasoning_details: vec![ReasoningDetailDelta {
                index: 0,
                detail_type: Some("text".to_string()),
                text: Some("thinking".to_string()),
            }],
            ..delta(0)
        }));
        acc.push_event(StreamEvent::Delta(ChoiceDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                arguments: Some("\"rust\"}".to_string()),
                ..Default::default()
            }],
            reasoning_details: vec![ReasoningDetailDelta {
                index: 0,
                text: Some("...done".to_string()),
                detail_type: None,
            }],
            ..delta(0)
        }));
        let resp = acc.finalize();

        match resp.body {
            RespBody::Chat(chat) => {
                let tool = &chat.choices[0].tool_calls[0];
                assert_eq!(tool.arguments, "{\"q\":\"rust\"}");
                assert_eq!(tool.name.as_deref(), Some("search"));
            }
            _ => panic!("expected chat response"),
        }
    }

    #[test]
    fn choices_are_ordered_by_index_regardless_of_arrival_order() {
        let mut acc = StreamAccumulator::new("id", "gpt", 0);
        acc.push_event(StreamEvent::Delta(ChoiceDelta {
            content: Some("b".to_string()),
            ..delta(1)
        }));
        acc.push_event(StreamEvent::Delta(ChoiceDelta {
            content: Some("a".to_string()),
            ..delta(0)
        }));
        let resp = acc.finalize();

        match resp.body {
            RespBody::Chat(chat) => {
                assert_eq!(chat.choices[0].index, 0);
                assert_eq!(chat.choices[1].index, 1);
            }
            _ => panic!("expected chat response"),
        }
    }

    #[test]
    fn finalize_on_cancel_marks_unfinished_choices() {
        let mut acc = StreamAccumulator::new("id", "gpt", 0);
        acc.push_event(StreamEvent::Delta(ChoiceDelta {
            content: Some("partial".to_string()),
            ..delta(0)
        }));
        let resp = acc.finalize_on_cancel();

        match resp.body {
            RespBody::Chat(chat) => {
                assert_eq!(chat.choices[0].finish_reason.as_deref(), Some("cancelled"));
            }
            _ => panic!("expected chat response"),
        }
    }
}
