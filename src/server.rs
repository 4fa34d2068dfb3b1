pub(crate) mod cli;
pub(crate) mod room;
mod session;
mod svg;
pub(crate) mod timers;

pub use self::cli::{CliOpts, Config};
use self::room::RoomEngine;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any as AnyOrigin, CorsLayer};

use crate::bus::Bus;
use crate::store::{self, RedisStore, RoomStore, StoreError};
use crate::words::WordCatalog;
use crate::world::{RoomStatus, RoomType};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error")]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owns the shared infrastructure and serves both the HTTP surface and the
/// WebSocket sessions. Cheap to clone; it is the axum state.
#[derive(Clone)]
pub struct GameServer {
    config: Arc<Config>,
    store: RoomStore,
    engine: RoomEngine,
    bus: Bus,
}

impl GameServer {
    pub async fn connect(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let redis = RedisStore::connect(&config.redis).await?;
        let store = RoomStore::new(redis.clone());
        let bus = Bus::new(redis);
        let engine = RoomEngine::new(
            store.clone(),
            bus.clone(),
            Arc::new(WordCatalog::embedded()),
            config.clone(),
        );

        // a crashed node's turn clocks come back as key expiries
        let (expired_tx, expired_rx) = flume::unbounded();
        store.spawn_expiry_watch(expired_tx);
        tokio::spawn(watch_expired_keys(engine.clone(), expired_rx));

        Ok(Self {
            config,
            store,
            engine,
            bus,
        })
    }

    pub fn config(&self) -> &Config { &self.config }

    pub(crate) fn engine(&self) -> &RoomEngine { &self.engine }

    pub(crate) fn bus(&self) -> &Bus { &self.bus }

    /// Serve until ctrl-c.
    pub async fn listen(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let app = router(self.clone());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    println!("✨ Ctrl-C received. Stopping..");
}

async fn watch_expired_keys(engine: RoomEngine, rx: flume::Receiver<String>) {
    while let Ok(key) = rx.recv_async().await {
        if let Some(room_id) = store::room_of_deadline_key(&key) {
            log::debug!("deadline sentinel expired for {}", room_id);
            timers::spawn_recovered_deadline(engine.clone(), room_id.to_owned());
        } else if let Some(room_id) = store::room_of_state_key(&key) {
            if let Err(err) = engine.cleanup_room(room_id).await {
                log::warn!("cleanup of expired room {} failed: {}", room_id, err);
            }
        }
    }
}

fn router(server: GameServer) -> Router {
    let cors = cors_layer(server.config());

    Router::new()
        .route("/health", get(health))
        .route("/api/rooms/join-random", get(join_random))
        .route("/api/rooms/generate-id", get(generate_id))
        .route("/api/images/game-over", post(game_over_image))
        .route("/ws", any(ws_handler))
        .layer(cors)
        .with_state(server)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_allowed_origins.iter().any(|origin| origin == "*") {
        CorsLayer::new()
            .allow_origin(AnyOrigin)
            .allow_methods(AnyOrigin)
            .allow_headers(AnyOrigin)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AnyOrigin)
            .allow_headers(AnyOrigin)
    }
}

async fn health() -> impl IntoResponse { Json(json!({ "status": "ok" })) }

async fn ws_handler(
    State(server): State<GameServer>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    log::info!("new client connection: {}", peer_addr);
    ws.on_upgrade(move |socket| session::run(socket, server, params, peer_addr))
}

/// `GET /api/rooms/join-random` — a random public room with a free seat.
async fn join_random(State(server): State<GameServer>) -> impl IntoResponse {
    match find_joinable_room(&server).await {
        Ok(Some(room_id)) => (StatusCode::OK, Json(json!({ "room_id": room_id }))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no joinable public room" })),
        ),
        Err(err) => {
            log::error!("join-random failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "state store unreachable" })),
            )
        }
    }
}

async fn find_joinable_room(server: &GameServer) -> Result<Option<String>> {
    let mut ids: Vec<String> = server.store.public_rooms().await?.into_iter().collect();
    ids.shuffle(&mut rand::thread_rng());

    for id in ids {
        let room = match server.store.load_room(&id).await? {
            Some(room) => room,
            None => continue,
        };
        if room.status == RoomStatus::Finished || room.settings.room_type != RoomType::Public {
            continue;
        }
        let presence = server.store.load_presence(&id).await?;
        if presence.len() < room.settings.max_players as usize {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// `GET /api/rooms/generate-id` — an unused adjective-noun slug.
async fn generate_id(State(server): State<GameServer>) -> impl IntoResponse {
    for _ in 0..32 {
        let slug = random_slug();
        match server.store.room_exists(&slug).await {
            Ok(false) => return (StatusCode::OK, Json(json!({ "room_id": slug }))).into_response(),
            Ok(true) => continue,
            Err(err) => {
                log::error!("generate-id failed: {}", err);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "state store unreachable" })),
                )
                    .into_response();
            }
        }
    }

    // the plain combinations are crowded, qualify with a number
    let slug = format!("{}-{}", random_slug(), rand::thread_rng().gen_range(10..100));
    (StatusCode::OK, Json(json!({ "room_id": slug }))).into_response()
}

/// `POST /api/images/game-over` — the final scoreboard as an SVG card.
async fn game_over_image(Json(request): Json<svg::ScoreboardRequest>) -> impl IntoResponse {
    let body = svg::render_scoreboard(&request);
    ([(header::CONTENT_TYPE, "image/svg+xml")], body)
}

const SLUG_ADJECTIVES: &[&str] = &[
    "happy", "sleepy", "brave", "calm", "clever", "cosmic", "curly", "dizzy", "eager", "fancy",
    "fuzzy", "gentle", "giant", "giddy", "golden", "jolly", "lazy", "lucky", "mellow", "mighty",
    "nimble", "noisy", "peppy", "plucky", "proud", "quick", "quiet", "rapid", "rusty", "salty",
    "shiny", "silly", "snappy", "sneaky", "sunny", "swift", "tiny", "wacky", "witty", "zesty",
];

const SLUG_NOUNS: &[&str] = &[
    "cat", "otter", "panda", "fox", "owl", "crab", "duck", "goose", "mole", "llama",
    "koala", "gecko", "lemur", "moose", "mouse", "newt", "raven", "robin", "seal", "shark",
    "sloth", "snail", "squid", "stork", "tapir", "toad", "trout", "walrus", "wombat", "yak",
    "badger", "beaver", "bison", "falcon", "ferret", "heron", "ibis", "jackal", "magpie", "puffin",
];

fn random_slug() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        SLUG_ADJECTIVES.choose(&mut rng).unwrap_or(&"happy"),
        SLUG_NOUNS.choose(&mut rng).unwrap_or(&"cat"),
    )
}
