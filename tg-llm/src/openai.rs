use crate::error::{LlmError, Result};
use crate::provider::{InferenceProvider, InferenceStream, assemble_events};
use crate::types::{ChatMessage, Role, StreamChunk, ToolDefinition, Usage};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streaming chat-completions client for OpenAI and API-compatible servers.
#[derive(Clone)]
pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiProvider {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: Option<&str>, api_key: Option<&str>, model: &str) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(LlmError::Config("model is required".to_string()));
        }
        let base_url = base_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(OPENAI_DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn chunk_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<impl Stream<Item = Result<StreamChunk>> + Send + Unpin + 'static> {
        let req = OpenAiChatRequest::new(&self.model, messages, tools);
        let mut builder = self.http.post(self.completions_url()).json(&req);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let state = OpenAiStreamState::default();
        let stream = futures_util::stream::unfold((sse, state), |(mut sse, mut state)| async move {
            loop {
                if let Some(chunk) = state.ready.pop_front() {
                    return Some((Ok(chunk), (sse, state)));
                }
                if state.done {
                    return None;
                }
                match sse.as_mut().next().await {
                    Some(Ok(SseEvent::Data(data))) => {
                        if let Err(e) = state.ingest(&data) {
                            state.done = true;
                            return Some((Err(e), (sse, state)));
                        }
                    }
                    Some(Ok(SseEvent::Other)) => continue,
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(e), (sse, state)));
                    }
                    None => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl InferenceProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn stream_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<InferenceStream> {
        tracing::debug!(
            message_count = messages.len(),
            tool_count = tools.len(),
            base_url = %self.base_url,
            "starting openai streaming call"
        );
        let chunks = self.chunk_stream(messages, tools).await?;
        Ok(assemble_events(chunks))
    }
}

#[derive(Debug, Default)]
struct OpenAiStreamToolCallState {
    id: Option<String>,
    name: Option<String>,
    started: bool,
    /// Arguments seen before id and name were both known.
    buffered: String,
}

#[derive(Debug, Default)]
struct OpenAiStreamState {
    tool_calls: HashMap<u32, OpenAiStreamToolCallState>,
    usage: Option<Usage>,
    ready: VecDeque<StreamChunk>,
    done: bool,
}

impl OpenAiStreamState {
    fn ingest(&mut self, data: &str) -> Result<()> {
        if data.trim() == "[DONE]" {
            self.ready.push_back(StreamChunk::Done {
                usage: self.usage.unwrap_or_default(),
            });
            self.done = true;
            return Ok(());
        }

        let chunk: OpenAiStreamResponseChunk = serde_json::from_str(data).map_err(|e| {
            LlmError::Decode(format!("openai chunk json error={e} data={data}"))
        })?;

        if let Some(u) = chunk.usage.as_ref() {
            self.usage = Some(Usage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0) as u32,
                completion_tokens: u.completion_tokens.unwrap_or(0) as u32,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };
        let delta = choice.delta;
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            self.ready.push_back(StreamChunk::Delta { content });
        }

        for tc in delta.tool_calls.unwrap_or_default() {
            let idx = tc.index.unwrap_or(0);
            let entry = self.tool_calls.entry(idx).or_default();
            if entry.id.is_none() {
                entry.id = tc.id.clone();
            }
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            if entry.name.is_none() {
                entry.name = name;
            }

            if !entry.started {
                entry.buffered.push_str(&arguments);
                let (Some(id), Some(name)) = (entry.id.clone(), entry.name.clone()) else {
                    continue;
                };
                entry.started = true;
                self.ready.push_back(StreamChunk::ToolCallStart { id, name });
                let buffered = std::mem::take(&mut entry.buffered);
                if !buffered.is_empty() {
                    self.ready
                        .push_back(StreamChunk::ToolCallDelta { arguments: buffered });
                }
            } else if !arguments.is_empty() {
                self.ready.push_back(StreamChunk::ToolCallDelta { arguments });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
    stream_options: OpenAiStreamOptions,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl OpenAiChatRequest {
    fn new(model: &str, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Self {
        let tools: Vec<OpenAiTool> = tools.iter().map(to_openai_tool).collect();
        Self {
            model: model.to_string(),
            messages: messages.iter().map(to_openai_message).collect(),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            tools,
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiToolFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunctionCall {
    name: String,
    arguments: String,
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    OpenAiMessage {
        role: role.to_string(),
        content: Some(m.content.clone()).filter(|s| !s.is_empty()),
        tool_calls: m
            .tool_calls
            .iter()
            .map(|tc| OpenAiToolCall {
                id: tc.id.clone(),
                r#type: "function".to_string(),
                function: OpenAiToolFunctionCall {
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                },
            })
            .collect(),
        tool_call_id: m.tool_call_id.clone(),
    }
}

#[derive(Debug)]
enum SseEvent {
    Data(String),
    Other,
}

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find("\n\n") {
                    let raw = buffer[..idx].to_string();
                    buffer.drain(..idx + 2);
                    return Some((Ok(parse_sse_record(&raw)), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Transport(e.to_string())), (stream, buffer)));
                    }
                    None => {
                        if buffer.trim().is_empty() {
                            return None;
                        }
                        let raw = std::mem::take(&mut buffer);
                        return Some((Ok(parse_sse_record(&raw)), (stream, buffer)));
                    }
                }
            }
        },
    )
}

fn parse_sse_record(raw: &str) -> SseEvent {
    let data_lines: Vec<&str> = raw
        .lines()
        .filter_map(|line| line.trim_end().strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data_lines.is_empty() {
        SseEvent::Other
    } else {
        SseEvent::Data(data_lines.join("\n"))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponseChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiStreamUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamDeltaToolFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
