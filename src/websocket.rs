//! # WebSocket Streaming Transcription
//!
//! Clients connect to `/ws/transcribe`, send audio as binary messages and
//! receive one JSON message per detected utterance.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: query parameters choose the input and hints:
//!    `format=pcm` for raw 16-bit mono PCM frames, any other value (or none)
//!    for container audio handed to ffmpeg; `language` and `task` optional.
//! 2. **Audio Streaming**: binary messages, in order.
//! 3. **Results**: `{text, language, language_probability, processing_time_seconds}`
//!    per utterance, `{error}` when something recoverable goes wrong.
//! 4. **End of stream**: `{"type":"end_of_stream"}` flushes the pipeline; the
//!    server sends the remaining results and closes the connection.
//!
//! ## Actor Model:
//! Each connection is one actor owning one [`StreamingSession`]. Binary
//! messages are fed with `ctx.wait`, so the actor stops reading the socket
//! while the pipeline is full. Session events arrive as a second stream on
//! the same actor.

use crate::audio::session::{SessionConfig, SessionEvent, SessionInput, StreamingSession};
use crate::error::AppError;
use crate::state::AppState;
use crate::transcription::TranscriptionResult;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Control messages from the client (text frames).
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    EndOfStream,
}

/// Messages to the client.
#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Transcript {
        text: String,
        language: String,
        language_probability: f32,
        processing_time_seconds: f64,
    },
    Error {
        error: String,
    },
}

impl From<TranscriptionResult> for ServerMessage {
    fn from(result: TranscriptionResult) -> Self {
        ServerMessage::Transcript {
            text: result.text,
            language: result.language,
            language_probability: result.language_probability,
            processing_time_seconds: result.processing_time_seconds,
        }
    }
}

impl ServerMessage {
    fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { error: message.into() }
    }
}

/// Holds one of the server's streaming slots until dropped.
struct SessionSlot(web::Data<AppState>);

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.release_session();
    }
}

pub struct TranscriptionWebSocket {
    session: Option<StreamingSession>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    last_heartbeat: Instant,
    _slot: SessionSlot,
}

impl TranscriptionWebSocket {
    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to serialize WebSocket message: {}", e),
        }
    }

    fn handle_audio(&mut self, data: web::Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        if data.is_empty() {
            return;
        }
        let Some(input) = self.session.as_ref().and_then(StreamingSession::input) else {
            self.send(ctx, &ServerMessage::error("Stream already ended"));
            return;
        };

        // Park the actor until the pipeline has room
        let chunk = data.to_vec();
        ctx.wait(
            async move { input.send(chunk).await.is_ok() }
                .into_actor(self)
                .map(|sent, _act, _ctx| {
                    if !sent {
                        debug!("audio arrived after the session pipeline closed");
                    }
                }),
        );
    }

    fn handle_control(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::EndOfStream) => {
                if let Some(session) = self.session.as_mut() {
                    info!(session_id = %session.id(), "client ended the stream");
                    session.finish();
                }
            }
            Err(e) => {
                warn!("Invalid control message: {}", e);
                self.send(ctx, &ServerMessage::error(format!("Invalid control message: {}", e)));
            }
        }
    }
}

impl Actor for TranscriptionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(events) = self.events.take() {
            ctx.add_stream(UnboundedReceiverStream::new(events));
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(mut session) = self.session.take() {
            info!(session_id = %session.id(), "WebSocket connection stopped");
            session.abort();
        }
    }
}

/// Incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranscriptionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(data, ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_control(&text, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Events from the session pipeline.
impl StreamHandler<SessionEvent> for TranscriptionWebSocket {
    fn handle(&mut self, event: SessionEvent, ctx: &mut Self::Context) {
        match event {
            SessionEvent::Transcript(result) => self.send(ctx, &result.into()),
            SessionEvent::Error(message) => self.send(ctx, &ServerMessage::error(message)),
            SessionEvent::Fatal(message) => {
                self.send(ctx, &ServerMessage::error(message));
                ctx.close(Some(ws::CloseCode::Error.into()));
                ctx.stop();
            }
            SessionEvent::Finished => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("session event stream ended");
        ctx.stop();
    }
}

/// Upgrade to a streaming transcription session.
///
/// Refused before the upgrade when the model is not ready, the session limit
/// is reached, the query is invalid, or the transcoder cannot start.
pub async fn transcribe_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let query = web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .unwrap_or_else(|_| web::Query(HashMap::new()));
    debug!("WebSocket query parameters: {:?}", query.iter().collect::<Vec<_>>());

    let input = session_input(query.get("format").map(String::as_str), &state.config.transcode.stream_input_format)?;
    let options = state
        .default_options()
        .with_hints(query.get("language").map(String::as_str), query.get("task").map(String::as_str))
        .map_err(AppError::from)?;

    if !state.manager.is_ready() {
        return Err(AppError::ServiceUnavailable("Model not loaded".to_string()).into());
    }
    if !state.try_acquire_session() {
        warn!("Rejecting WebSocket connection: session limit reached");
        return Err(AppError::ServiceUnavailable("Too many active streaming sessions".to_string()).into());
    }
    let slot = SessionSlot(state.clone());

    let config = SessionConfig::from_app_config(&state.config, input, options);
    let (session, events) = StreamingSession::start(config, state.manager.clone(), &state.normalizer)
        .map_err(|e| {
            error!("Failed to start streaming session: {}", e);
            AppError::ServiceUnavailable("Audio transcoder unavailable".to_string())
        })?;

    let actor = TranscriptionWebSocket {
        session: Some(session),
        events: Some(events),
        last_heartbeat: Instant::now(),
        _slot: slot,
    };
    ws::start(actor, &req, stream)
}

/// `pcm` selects raw frames; anything else names an ffmpeg demuxer.
fn session_input(format: Option<&str>, default_format: &str) -> Result<SessionInput, AppError> {
    let format = format.map(str::trim).filter(|f| !f.is_empty()).unwrap_or(default_format);
    if format.eq_ignore_ascii_case("pcm") {
        return Ok(SessionInput::Pcm);
    }
    if !format.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ',') {
        return Err(AppError::BadRequest(format!("Invalid stream format: {}", format)));
    }
    Ok(SessionInput::Transcoded { format: format.to_lowercase() })
}
