//! One task per WebSocket connection: authenticate, wait for the channel
//! join, then shuttle frames between the socket and the bus until either
//! side goes away.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;

use crate::auth;
use crate::bus::{room_topic, user_topic};
use crate::message::{
    validate_name, validate_room_slug, ClientCommand, Frame, JoinParams, ServerEvent,
};

use super::room::{EngineError, JoinOutcome, RelayKind, VoiceUpdate};
use super::GameServer;

/// how long a socket may idle before the join
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Disconnect client after this many seconds of no traffic
const TIMED_OUT_SECONDS: u64 = 60;

pub async fn run(
    socket: WebSocket,
    server: GameServer,
    params: HashMap<String, String>,
    peer_addr: SocketAddr,
) {
    let identity = auth::authenticate(
        server.config().secret_key_base.as_deref(),
        params.get("token").map(String::as_str),
        params.get("user_id").map(String::as_str),
    );

    let identity = match identity {
        Ok(identity) => identity,
        Err(err) => {
            log::info!("({}): rejected connection: {}", peer_addr, err);
            let frame = Frame::push(
                "phoenix",
                &ServerEvent::Error { message: "authentication failed".to_owned() },
            );
            let (mut ws_tx, _) = socket.split();
            let _ = ws_tx.send(Message::Text(frame.to_json().into())).await;
            let _ = ws_tx.close().await;
            return;
        }
    };

    let (ws_tx, ws_rx) = socket.split();
    let session = UserSession {
        server,
        user_id: identity.user_id,
        socket_ref: format!("{:016x}", rand::random::<u64>()),
        peer_addr,
        ws_tx,
        ws_rx,
        last_seen: Instant::now(),
    };
    session.run().await;
}

struct UserSession {
    server: GameServer,
    user_id: String,
    /// unique per connection; lets broadcasts exclude this socket
    socket_ref: String,
    peer_addr: SocketAddr,
    ws_tx: SplitSink<WebSocket, Message>,
    ws_rx: SplitStream<WebSocket>,
    last_seen: Instant,
}

impl UserSession {
    async fn run(mut self) {
        log::debug!("started session for {} ({})", self.user_id, self.peer_addr);

        let (room_id, topic) = match self.await_join().await {
            Some(joined) => joined,
            None => {
                log::debug!("({}): closed before joining a room", self.peer_addr);
                return;
            }
        };

        let room_sub = self.server.bus().subscribe(&room_topic(&room_id));
        let user_sub = self.server.bus().subscribe(&user_topic(&self.user_id));
        let own_topic = user_topic(&self.user_id);

        let mut check_interval = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    if self.last_seen.elapsed() > Duration::from_secs(TIMED_OUT_SECONDS) {
                        log::info!("({}): client heartbeat failed, disconnecting", self.peer_addr);
                        break;
                    }
                }

                msg = self.ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.last_seen = Instant::now();
                        let text = text.to_string();
                        if self.handle_text(&room_id, &topic, &text).await.is_break() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => self.last_seen = Instant::now(),
                    Some(Err(err)) => {
                        log::debug!("({}): socket error: {}", self.peer_addr, err);
                        break;
                    }
                },

                envelope = room_sub.rx.recv_async() => match envelope {
                    Ok(envelope) => {
                        if envelope.except_socket.as_deref() == Some(self.socket_ref.as_str()) {
                            continue;
                        }
                        if !self.send_frame(envelope.to_frame(&topic)).await {
                            break;
                        }
                    }
                    Err(_) => break,
                },

                envelope = user_sub.rx.recv_async() => match envelope {
                    Ok(envelope) => {
                        let kicked = envelope.event == "player_kicked";
                        let sent = self.send_frame(envelope.to_frame(&own_topic)).await;
                        if kicked {
                            log::info!("{} was kicked, closing socket", self.user_id);
                            break;
                        }
                        if !sent {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }

        drop(room_sub);
        drop(user_sub);

        if let Err(err) = self
            .server
            .engine()
            .leave(&room_id, &self.user_id, &self.socket_ref)
            .await
        {
            log::warn!("leave of {} from {} failed: {}", self.user_id, room_id, err);
        }
        log::debug!("stopped session for {} ({})", self.user_id, self.peer_addr);
    }

    /// First phase of every connection: nothing but `phx_join` (and
    /// heartbeats) is accepted until the socket is in a room.
    async fn await_join(&mut self) -> Option<(String, String)> {
        let deadline = Instant::now() + JOIN_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let msg = match tokio::time::timeout(remaining, self.ws_rx.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(_))) | Ok(None) => return None,
                Err(_) => return None,
            };

            let text = match msg {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => return None,
                _ => continue,
            };

            let frame = match Frame::parse(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    self.send_event("phoenix", &ServerEvent::Error { message: err.to_string() })
                        .await;
                    continue;
                }
            };

            if frame.event == "heartbeat" {
                self.send_frame(Frame::reply_ok(&frame.topic, frame.reference, json!({})))
                    .await;
                continue;
            }
            if frame.event != "phx_join" {
                self.send_frame(Frame::reply_error(
                    &frame.topic,
                    frame.reference,
                    "join a room first",
                ))
                .await;
                continue;
            }

            let slug = match frame.room_slug().map(validate_room_slug) {
                Some(Ok(slug)) => slug,
                _ => {
                    self.send_frame(Frame::reply_error(
                        &frame.topic,
                        frame.reference,
                        "invalid room topic",
                    ))
                    .await;
                    continue;
                }
            };

            let join: JoinParams = match serde_json::from_value(frame.payload.clone()) {
                Ok(join) => join,
                Err(_) => {
                    self.send_frame(Frame::reply_error(
                        &frame.topic,
                        frame.reference,
                        "invalid join payload",
                    ))
                    .await;
                    continue;
                }
            };
            let name = match validate_name(&join.name) {
                Ok(name) => name,
                Err(err) => {
                    self.send_frame(Frame::reply_error(
                        &frame.topic,
                        frame.reference,
                        &err.to_string(),
                    ))
                    .await;
                    continue;
                }
            };

            let outcome = self
                .server
                .engine()
                .join(
                    &slug,
                    &self.user_id,
                    name,
                    join.avatar,
                    join.room_type,
                    &self.socket_ref,
                )
                .await;

            match outcome {
                Ok(outcome) => {
                    let topic = frame.topic.clone();
                    log::info!("{} joined room {}", self.user_id, slug);
                    self.push_join_state(&topic, frame.reference, outcome).await;
                    return Some((slug, topic));
                }
                Err(err) => {
                    let message = match err {
                        EngineError::Validation(message) => message,
                        EngineError::Unauthorized => "not allowed".to_owned(),
                        EngineError::Conflict => "could not join right now".to_owned(),
                        EngineError::Store(err) => {
                            log::error!("join of {} failed: {}", slug, err);
                            "something went wrong, please retry".to_owned()
                        }
                    };
                    self.send_frame(Frame::reply_error(&frame.topic, frame.reference, &message))
                        .await;
                }
            }
        }
    }

    async fn push_join_state(
        &mut self,
        topic: &str,
        reference: Option<serde_json::Value>,
        outcome: JoinOutcome,
    ) {
        let response = json!({
            "user_id": self.user_id,
            "room_info": outcome.room_info,
            "word": outcome.word,
        });
        self.send_frame(Frame::reply_ok(topic, reference, response)).await;

        self.send_event(topic, &ServerEvent::PresenceState(outcome.presence)).await;
        if let Some(batch) = outcome.canvas {
            self.send_event(topic, &ServerEvent::Drawing(batch)).await;
        }
        if let Some(words) = outcome.word_choices {
            self.send_event(topic, &ServerEvent::SelectWord { words }).await;
        }
    }

    async fn handle_text(&mut self, room_id: &str, topic: &str, text: &str) -> ControlFlow<()> {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.send_event(topic, &ServerEvent::Error { message: err.to_string() })
                    .await;
                return ControlFlow::Continue(());
            }
        };

        if frame.event == "heartbeat" {
            self.send_frame(Frame::reply_ok(&frame.topic, frame.reference, json!({})))
                .await;
            return ControlFlow::Continue(());
        }
        if frame.event == "phx_leave" {
            self.send_frame(Frame::reply_ok(topic, frame.reference, json!({})))
                .await;
            return ControlFlow::Break(());
        }
        if frame.topic != topic {
            self.send_frame(Frame::reply_error(
                &frame.topic,
                frame.reference,
                "not joined to that topic",
            ))
            .await;
            return ControlFlow::Continue(());
        }
        if frame.event == "phx_join" {
            self.send_frame(Frame::reply_error(&frame.topic, frame.reference, "already joined"))
                .await;
            return ControlFlow::Continue(());
        }

        let command = match ClientCommand::parse(&frame.event, frame.payload.clone()) {
            Ok(command) => command,
            Err(err) => {
                self.send_event(topic, &ServerEvent::Error { message: err.to_string() })
                    .await;
                return ControlFlow::Continue(());
            }
        };

        if let Err(err) = self.dispatch(room_id, command).await {
            self.report_engine_error(room_id, topic, err).await;
        }
        ControlFlow::Continue(())
    }

    async fn dispatch(&self, room_id: &str, command: ClientCommand) -> Result<(), EngineError> {
        let engine = self.server.engine();
        let user_id = self.user_id.as_str();

        match command {
            ClientCommand::NewMessage { message } => engine.chat(room_id, user_id, &message).await,
            ClientCommand::Drawing(batch) => {
                engine.draw(room_id, user_id, batch, &self.socket_ref).await
            }
            ClientCommand::DrawingClear => {
                engine.clear_canvas(room_id, user_id, &self.socket_ref).await
            }
            ClientCommand::StartGame => engine.start_game(room_id, user_id).await,
            ClientCommand::StartTurn { word } => engine.start_turn(room_id, user_id, &word).await,
            ClientCommand::SkipWords => engine.skip_words(room_id, user_id).await,
            ClientCommand::UpdateRoomSettings(patch) => {
                engine.update_settings(room_id, user_id, patch).await
            }
            ClientCommand::VoteToKick { target_id } => {
                engine.vote_to_kick(room_id, user_id, &target_id).await
            }
            ClientCommand::VoiceJoin => {
                engine.voice_update(room_id, user_id, VoiceUpdate::Join).await
            }
            ClientCommand::VoiceLeave => {
                engine.voice_update(room_id, user_id, VoiceUpdate::Leave).await
            }
            ClientCommand::VoiceMute { muted } => {
                engine.voice_update(room_id, user_id, VoiceUpdate::Mute(muted)).await
            }
            ClientCommand::WebrtcOffer(payload) => {
                engine.webrtc_relay(room_id, user_id, RelayKind::Offer, payload).await
            }
            ClientCommand::WebrtcAnswer(payload) => {
                engine.webrtc_relay(room_id, user_id, RelayKind::Answer, payload).await
            }
            ClientCommand::WebrtcIceCandidate(payload) => {
                engine
                    .webrtc_relay(room_id, user_id, RelayKind::IceCandidate, payload)
                    .await
            }
            ClientCommand::Heartbeat => Ok(()),
        }
    }

    async fn report_engine_error(&mut self, room_id: &str, topic: &str, err: EngineError) {
        match err {
            EngineError::Validation(message) => {
                self.send_event(topic, &ServerEvent::Error { message }).await;
            }
            EngineError::Unauthorized => {
                self.send_event(topic, &ServerEvent::Error { message: "not allowed".to_owned() })
                    .await;
            }
            // the command raced a transition; resync the client instead
            EngineError::Conflict => {
                if let Ok(snapshot) = self.server.engine().room_snapshot(room_id).await {
                    self.send_event(topic, &ServerEvent::RoomInfo(snapshot)).await;
                }
            }
            EngineError::Store(err) => {
                log::error!("command in {} failed: {}", room_id, err);
                self.send_event(
                    topic,
                    &ServerEvent::Error { message: "something went wrong, please retry".to_owned() },
                )
                .await;
            }
        }
    }

    async fn send_event(&mut self, topic: &str, event: &ServerEvent) -> bool {
        self.send_frame(Frame::push(topic, event)).await
    }

    async fn send_frame(&mut self, frame: Frame) -> bool {
        match self.ws_tx.send(Message::Text(frame.to_json().into())).await {
            Ok(()) => true,
            Err(err) => {
                log::debug!("({}): could not write frame: {}", self.peer_addr, err);
                false
            }
        }
    }
}
