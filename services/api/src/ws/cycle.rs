//! One agent reply: optional tool use, then a streamed response.

use crate::{
    models::{MessageRole, TranscriptEntry},
    state::AppState,
    ws::{
        protocol::ServerMessage,
        session::{WsSink, send_msg},
    },
};
use anyhow::{Context, Result};
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs, ChatCompletionTool,
    ChatCompletionToolArgs, FunctionObjectArgs,
};
use futures_util::StreamExt;
use lexis_core::{
    llm_client::{LLMAction, LLMStream, LLMStreamEvent},
    mode::ConversationMode,
};
use rmcp::{
    model::{CallToolRequestParam, RawContent, Tool},
    service::{RoleClient, RunningService},
};
use std::sync::Arc;
use tracing::{info, warn};

/// Cue for the agent's first line; never stored in the transcript.
const OPENING_CUE: &str =
    "(The learner has just joined. Open the conversation as instructed, in one or two sentences.)";

pub(crate) type ToolClient = RunningService<RoleClient, ()>;

/// The agent speaks first. Role-play scenarios may script the opening line.
pub async fn speak_opening(
    state: &Arc<AppState>,
    mode: &ConversationMode,
    system_prompt: &str,
    transcript: &mut Vec<TranscriptEntry>,
    sink: &WsSink,
) -> Result<()> {
    if let ConversationMode::RolePlay(config) = mode {
        if let Some(starter) = &config.conversation_starter {
            info!("Opening with the scenario's conversation starter");
            send_whole(sink, starter).await?;
            transcript.push(TranscriptEntry::ai(starter.clone()));
            return Ok(());
        }
    }

    let cue: Vec<ChatCompletionRequestMessage> = vec![
        ChatCompletionRequestUserMessageArgs::default()
            .content(OPENING_CUE)
            .build()?
            .into(),
    ];
    let stream = state
        .llm_client
        .stream_reply(system_prompt.to_string(), cue)
        .await?;
    let opening = relay_stream(sink, stream).await?;
    if !opening.is_empty() {
        transcript.push(TranscriptEntry::ai(opening));
    }
    Ok(())
}

/// Produces the agent's reply to the latest user turn in `transcript`.
///
/// With a tool client the model may first call tools; their results are fed
/// back before the final reply is streamed.
pub async fn run_reply_cycle(
    state: &Arc<AppState>,
    system_prompt: &str,
    transcript: &mut Vec<TranscriptEntry>,
    tools: Option<&ToolClient>,
    sink: &WsSink,
) -> Result<()> {
    let messages = to_chat_messages(transcript)?;

    let reply = match tools {
        None => {
            let stream = state
                .llm_client
                .stream_reply(system_prompt.to_string(), messages)
                .await?;
            relay_stream(sink, stream).await?
        }
        Some(client) => {
            let definitions = tool_definitions(client.list_all_tools().await?)?;
            let action = state
                .llm_client
                .decide_action(system_prompt.to_string(), messages.clone(), definitions)
                .await?;
            match action {
                LLMAction::TextResponse(text) => {
                    send_whole(sink, &text).await?;
                    text
                }
                LLMAction::ToolCall(tool_calls) => {
                    let mut history_with_tools = messages;
                    history_with_tools.push(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .tool_calls(tool_calls.clone())
                            .build()?
                            .into(),
                    );
                    for call in &tool_calls {
                        let result = call_tool(client, &call.function.name, &call.function.arguments)
                            .await?;
                        history_with_tools.push(
                            ChatCompletionRequestToolMessageArgs::default()
                                .tool_call_id(call.id.clone())
                                .content(result)
                                .build()?
                                .into(),
                        );
                    }
                    let stream = state
                        .llm_client
                        .stream_reply(system_prompt.to_string(), history_with_tools)
                        .await?;
                    relay_stream(sink, stream).await?
                }
            }
        }
    };

    if !reply.is_empty() {
        transcript.push(TranscriptEntry::ai(reply));
    }
    Ok(())
}

async fn call_tool(client: &ToolClient, name: &str, arguments: &str) -> Result<String> {
    info!(tool = %name, "Model requested tool call");
    let arguments = if arguments.trim().is_empty() {
        serde_json::Map::new()
    } else {
        serde_json::from_str(arguments).context("Tool arguments were not a JSON object")?
    };
    let result = client
        .peer()
        .call_tool(CallToolRequestParam {
            name: name.to_string().into(),
            arguments: Some(arguments),
        })
        .await?;

    if result.is_error == Some(true) {
        warn!(tool = %name, "Tool reported an error");
    }
    let annotated_content = result
        .content
        .context("Tool call returned no content")?
        .pop()
        .context("Content list was empty")?;
    Ok(match annotated_content.raw {
        RawContent::Text(text_content) => text_content.text,
        _ => "{\"error\": \"Unexpected content type from tool\"}".to_string(),
    })
}

fn tool_definitions(tools: Vec<Tool>) -> Result<Vec<ChatCompletionTool>> {
    tools
        .into_iter()
        .map(|t| {
            Ok(ChatCompletionToolArgs::default()
                .function(
                    FunctionObjectArgs::default()
                        .name(t.name)
                        .description(t.description.unwrap_or_default())
                        .parameters(serde_json::to_value(&*t.input_schema)?)
                        .build()?,
                )
                .build()?)
        })
        .collect()
}

pub(crate) fn to_chat_messages(
    transcript: &[TranscriptEntry],
) -> Result<Vec<ChatCompletionRequestMessage>> {
    transcript
        .iter()
        .map(|entry| {
            Ok(match entry.role {
                MessageRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(entry.content.clone())
                    .build()?
                    .into(),
                MessageRole::Ai => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(entry.content.clone())
                    .build()?
                    .into(),
            })
        })
        .collect()
}

/// Streams a reply to the client chunk by chunk and returns the full text.
/// The sink is locked per frame so client RPCs can interleave.
async fn relay_stream(sink: &WsSink, mut stream: LLMStream) -> Result<String> {
    send_msg(&mut *sink.lock().await, ServerMessage::ResponseStart).await?;
    let mut full_response = String::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(LLMStreamEvent::TextChunk(chunk)) => {
                full_response.push_str(&chunk);
                send_msg(
                    &mut *sink.lock().await,
                    ServerMessage::ResponseChunk { chunk },
                )
                .await?;
            }
            Err(e) => {
                warn!(error = %e, "Reply stream failed; ending response early");
                break;
            }
        }
    }
    send_msg(&mut *sink.lock().await, ServerMessage::ResponseEnd).await?;
    Ok(full_response)
}

async fn send_whole(sink: &WsSink, text: &str) -> Result<()> {
    let mut sink = sink.lock().await;
    send_msg(&mut sink, ServerMessage::ResponseStart).await?;
    send_msg(
        &mut sink,
        ServerMessage::ResponseChunk {
            chunk: text.to_string(),
        },
    )
    .await?;
    send_msg(&mut sink, ServerMessage::ResponseEnd).await
}
