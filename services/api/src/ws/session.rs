//! Manages the WebSocket connection lifecycle for one practice session.

use super::{
    cycle::{self, ToolClient},
    protocol::{ClientMessage, ServerMessage, metadata_string},
    rpc::{PendingRpcs, WsPeerTransport},
};
use crate::{models::TranscriptEntry, state::AppState};
use anyhow::{Context, Result, bail};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use lexis_core::{
    controller::{ConversationController, TurnPolicy},
    evaluator::TurnEvaluator,
    lexical::{SessionContext, TargetLexicalItem},
    metadata::ParticipantInfo,
    mode::ConversationMode,
    notify::NotificationGateway,
    routing::{Resolution, SessionModeRouter},
    terminal::{GracePeriods, TerminalStateManager},
    tools::ExplanationTools,
};
use rmcp::ServiceExt;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

pub(crate) type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Splits the socket, starts the reader task and runs the session to
/// completion. Any error ends the connection after it is reported to the
/// client.
#[instrument(name = "lexis_session", skip_all, fields(session_id, participant))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", &session_id.to_string());
    info!("New WebSocket connection. Awaiting join...");

    let (socket_tx, socket_rx) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(socket_tx));
    let pending = Arc::new(PendingRpcs::default());
    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let reader = tokio::spawn(read_frames(socket_rx, pending.clone(), inbound_tx).in_current_span());

    if let Err(e) = run_session(&state, session_id, &sink, pending, inbound_rx).await {
        error!(error = ?e, "Session terminated with error.");
        let _ = send_msg(
            &mut *sink.lock().await,
            ServerMessage::Error {
                message: format!("{e:#}"),
            },
        )
        .await;
    }

    reader.abort();
    let _ = sink.lock().await.close().await;
    info!("WebSocket connection closed and session terminated.");
}

/// Reads client frames until the socket closes.
///
/// RPC acknowledgements are completed right here so they are never queued
/// behind a reply that is still being generated.
async fn read_frames(
    mut socket_rx: SplitStream<WebSocket>,
    pending: Arc<PendingRpcs>,
    inbound: mpsc::Sender<ClientMessage>,
) {
    while let Some(frame) = socket_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::RpcResponse { id, payload, error }) => {
                    let result = match error {
                        Some(reason) => Err(reason),
                        None => Ok(payload.unwrap_or_default()),
                    };
                    if !pending.complete(id, result) {
                        debug!(id, "Dropping response for an RPC nobody is waiting on");
                    }
                }
                Ok(msg) => {
                    if inbound.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed client message."),
            },
            Ok(Message::Close(_)) => {
                info!("Client sent close frame.");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error receiving from client WebSocket: {:?}", e);
                break;
            }
        }
    }
}

/// Tool server and client for explanation mode, connected in-process.
struct ToolSession {
    client: ToolClient,
    server: JoinHandle<()>,
}

async fn run_session(
    state: &Arc<AppState>,
    session_id: Uuid,
    sink: &WsSink,
    pending: Arc<PendingRpcs>,
    mut inbound: mpsc::Receiver<ClientMessage>,
) -> Result<()> {
    let mut participant = match inbound.recv().await {
        Some(ClientMessage::Join {
            identity,
            name,
            metadata,
            attributes,
        }) => ParticipantInfo {
            identity,
            name,
            metadata: metadata_string(metadata),
            attributes,
        },
        Some(_) => bail!("First message must be `join`"),
        None => {
            info!("Client disconnected before joining.");
            return Ok(());
        }
    };
    tracing::Span::current().record("participant", participant.identity.as_str());
    info!("Participant joined; resolving practice mode");

    let context = Arc::new(Mutex::new(SessionContext::new(
        participant
            .name
            .clone()
            .unwrap_or_else(|| participant.identity.clone()),
    )));
    let Some(mode) = resolve_mode(state, sink, &mut inbound, &mut participant, &context).await?
    else {
        info!("Client disconnected while metadata was pending.");
        return Ok(());
    };

    // --- Per-session services ---
    let transport = Arc::new(WsPeerTransport::new(sink.clone(), pending));
    let gateway = Arc::new(
        NotificationGateway::new(transport, participant.identity.clone())
            .with_timeout(state.config.rpc_timeout),
    );
    let terminal = TerminalStateManager::new(gateway.clone());
    let evaluator = Arc::new(
        TurnEvaluator::new(state.judge.clone(), state.prompts.evaluate_usage.clone())
            .with_translation_language(state.config.accepted_translation_language.clone()),
    );
    let grace = state.grace_periods(mode.kind());
    let (progress_tx, mut progress_rx) = mpsc::channel::<TargetLexicalItem>(8);

    let tools = match &mode {
        ConversationMode::Explanation(_) => Some(
            start_tools(&mode, &context, &terminal, &gateway, grace, progress_tx.clone()).await?,
        ),
        ConversationMode::RolePlay(_) => None,
    };
    let mut controller = ConversationController::new(
        mode.clone(),
        context.clone(),
        evaluator,
        terminal.clone(),
        gateway,
        grace,
    )
    .with_progress(progress_tx);

    let (target, voice_persona) = match &mode {
        ConversationMode::Explanation(_) => (context.lock().await.target_item.clone(), None),
        ConversationMode::RolePlay(config) => (None, config.voice_persona.clone()),
    };
    send_msg(
        &mut *sink.lock().await,
        ServerMessage::Joined {
            session_id,
            mode: mode.kind(),
            target,
            voice_persona,
        },
    )
    .await?;

    let system_prompt = mode.system_prompt(&state.prompts);
    let mut transcript: Vec<TranscriptEntry> = Vec::new();
    let outcome = async {
        cycle::speak_opening(state, &mode, &system_prompt, &mut transcript, sink).await?;

        let closed = terminal.closed();
        tokio::pin!(closed);
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(ClientMessage::UserTurn { text }) => {
                        transcript.push(TranscriptEntry::user(text.clone()));
                        controller.on_user_turn_completed(&text).await;
                        cycle::run_reply_cycle(
                            state,
                            &system_prompt,
                            &mut transcript,
                            tools.as_ref().map(|t| &t.client),
                            sink,
                        )
                        .await?;
                    }
                    Some(ClientMessage::UpdateParticipant { .. }) => {
                        debug!("Ignoring participant update; mode is already resolved.");
                    }
                    Some(other) => warn!(message = ?other, "Ignoring unexpected message."),
                    None => {
                        info!("Client disconnected.");
                        break;
                    }
                },
                Some(item) = progress_rx.recv() => {
                    send_msg(&mut *sink.lock().await, ServerMessage::ProgressUpdate { item }).await?;
                },
                _ = &mut closed => {
                    info!(outcome = ?terminal.outcome().map(|o| o.kind), "Terminal outcome delivered; closing session.");
                    break;
                },
            }
        }
        anyhow::Ok(())
    }
    .await;

    // Teardown runs on every exit path.
    controller.shutdown();
    terminal.shutdown();
    if let Some(tools) = tools {
        tools.server.abort();
        let _ = tools.client.cancel().await;
    }
    info!(turns = controller.turn_count(), transcript = transcript.len(), "Session torn down.");
    outcome
}

/// Resolves the participant's mode, waiting for late metadata under the
/// configured retry policy. `Ok(None)` means the client went away.
async fn resolve_mode(
    state: &Arc<AppState>,
    sink: &WsSink,
    inbound: &mut mpsc::Receiver<ClientMessage>,
    participant: &mut ParticipantInfo,
    context: &Arc<Mutex<SessionContext>>,
) -> Result<Option<ConversationMode>> {
    let policy = state.metadata_retry();
    let mut router = SessionModeRouter::new(state.config.end_on_first_success);

    for attempt in 0..policy.max_attempts {
        match router
            .resolve(participant, context)
            .await
            .context("Invalid participant metadata")?
        {
            Resolution::Ready(mode) => {
                info!(mode = ?mode.kind(), phrase = %mode.target_phrase(), "Practice mode resolved");
                return Ok(Some(mode));
            }
            Resolution::Pending => {}
        }
        if attempt + 1 == policy.max_attempts {
            break;
        }

        send_msg(
            &mut *sink.lock().await,
            ServerMessage::AwaitingMetadata {
                attempt: attempt + 1,
                max_attempts: policy.max_attempts,
            },
        )
        .await?;
        let delay = policy.backoff(attempt);
        info!(attempt = attempt + 1, ?delay, "Metadata pending; waiting for an update");
        match tokio::time::timeout(delay, next_update(inbound)).await {
            Ok(Some((metadata, attributes))) => participant.merge(metadata, attributes),
            Ok(None) => return Ok(None),
            Err(_) => debug!("No participant update before the retry deadline"),
        }
    }

    bail!(
        "No usable participant metadata after {} attempts",
        policy.max_attempts
    )
}

async fn next_update(
    inbound: &mut mpsc::Receiver<ClientMessage>,
) -> Option<(Option<String>, HashMap<String, String>)> {
    loop {
        match inbound.recv().await? {
            ClientMessage::UpdateParticipant {
                metadata,
                attributes,
            } => return Some((metadata_string(metadata), attributes)),
            other => warn!(message = ?other, "Ignoring message while metadata is pending."),
        }
    }
}

async fn start_tools(
    mode: &ConversationMode,
    context: &Arc<Mutex<SessionContext>>,
    terminal: &Arc<TerminalStateManager>,
    gateway: &Arc<NotificationGateway>,
    grace: GracePeriods,
    progress_tx: mpsc::Sender<TargetLexicalItem>,
) -> Result<ToolSession> {
    let service = ExplanationTools::new(
        TurnPolicy::for_mode(mode),
        context.clone(),
        terminal.clone(),
        gateway.clone(),
        grace,
        Some(progress_tx),
    );
    let (server_transport, client_transport) = tokio::io::duplex(4096);

    let server = tokio::spawn(
        async move {
            match service.serve(server_transport).await {
                Ok(service) => {
                    let _ = service.waiting().await;
                }
                Err(e) => error!(error = ?e, "Tool server failed to start"),
            }
        }
        .in_current_span(),
    );
    let client = ().serve(client_transport).await?;
    Ok(ToolSession { client, server })
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
