//! Redis-backed room state. Every mutable piece of a room lives under
//! `room:{id}:*` so any node can pick a room up, and the short-TTL deadline
//! sentinel turns node loss into an ordinary key-expiry event.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::world::{Player, Room};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store unreachable")]
    Redis(#[from] redis::RedisError),
    #[error("could not de/serialize stored value")]
    Serde(#[from] serde_json::Error),
    #[error("room is locked")]
    LockBusy,
}

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Thin typed wrapper over one shared multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    db: i64,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        let conn = client.get_connection_manager().await?;

        let store = Self {
            client,
            conn,
            db: config.db,
        };

        // expired-key events drive turn recovery; not fatal when the server
        // forbids CONFIG (managed Redis), the local timers still run
        if let Err(err) = store.enable_keyevent_notifications().await {
            log::warn!("could not enable key-expiry notifications: {}", err);
        }

        Ok(store)
    }

    async fn enable_keyevent_notifications(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(serde_json::to_string(value)?)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// SET NX PX; true when the key was set.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn set_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    pub async fn expire(&self, key: &str, secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(secs)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn persist(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PERSIST").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members.into_iter().collect())
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn hvals(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = redis::cmd("HVALS").arg(key).query_async(&mut conn).await?;
        Ok(values)
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> ConnectionManager { self.conn.clone() }

    pub(crate) fn client(&self) -> redis::Client { self.client.clone() }

    /// Feed every expired key of this database into `tx` until the receiver
    /// goes away. Reconnects with backoff when the pub/sub link drops.
    pub fn spawn_expiry_watch(&self, tx: flume::Sender<String>) {
        let client = self.client.clone();
        let pattern = format!("__keyevent@{}__:expired", self.db);

        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(err) = pubsub.psubscribe(&pattern).await {
                            log::warn!("expiry watch psubscribe failed: {}", err);
                        } else {
                            log::debug!("expiry watch listening on {}", pattern);
                            let mut stream = Box::pin(pubsub.on_message());
                            while let Some(msg) = stream.next().await {
                                let key: String = match msg.get_payload() {
                                    Ok(key) => key,
                                    Err(_) => continue,
                                };
                                if tx.send(key).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => log::warn!("expiry watch could not connect: {}", err),
                }

                if tx.is_disconnected() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }
}

// key layout, one room per id
fn k_state(id: &str) -> String { format!("room:{}:state", id) }
fn k_players(id: &str) -> String { format!("room:{}:players", id) }
fn k_presence(id: &str) -> String { format!("room:{}:presence", id) }
fn k_canvas(id: &str) -> String { format!("room:{}:canvas", id) }
fn k_used_words(id: &str) -> String { format!("room:{}:used_words", id) }
fn k_kick(id: &str, target: &str) -> String { format!("room:{}:kick:{}", id, target) }
fn k_kicked(id: &str) -> String { format!("room:{}:kicked", id) }
fn k_deadline(id: &str) -> String { format!("room:{}:turn_deadline", id) }
fn k_lock(id: &str) -> String { format!("room:{}:lock", id) }

pub const PUBLIC_ROOMS_KEY: &str = "rooms:public";
pub const DEADLINE_SUFFIX: &str = ":turn_deadline";
pub const STATE_SUFFIX: &str = ":state";

const LOCK_TTL_MS: u64 = 5_000;
const LOCK_RETRY_MS: u64 = 10;
const LOCK_RETRIES: u32 = 100;

const RELEASE_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Advisory per-room lock. The TTL bounds how long a crashed holder can
/// block the room.
pub struct RoomLock {
    store: RedisStore,
    key: String,
    token: String,
}

impl RoomLock {
    pub async fn release(self) {
        let script = redis::Script::new(RELEASE_SCRIPT);
        let mut conn = self.store.connection();
        if let Err(err) = script
            .key(&self.key)
            .arg(&self.token)
            .invoke_async::<()>(&mut conn)
            .await
        {
            // the TTL will clean it up
            log::warn!("failed to release {}: {}", self.key, err);
        }
    }
}

/// The room-shaped view of the store: all operations the engine needs,
/// keyed per §layout above.
#[derive(Clone)]
pub struct RoomStore {
    redis: RedisStore,
}

impl RoomStore {
    pub fn new(redis: RedisStore) -> Self { Self { redis } }

    /// Serialize all mutations of one room through SETNX + TTL.
    pub async fn lock(&self, room_id: &str) -> Result<RoomLock> {
        let key = k_lock(room_id);
        let token = format!("{:016x}", rand::random::<u64>());

        for _ in 0..LOCK_RETRIES {
            if self.redis.set_nx_px(&key, &token, LOCK_TTL_MS).await? {
                return Ok(RoomLock {
                    store: self.redis.clone(),
                    key,
                    token,
                });
            }
            tokio::time::sleep(Duration::from_millis(LOCK_RETRY_MS)).await;
        }

        Err(StoreError::LockBusy)
    }

    pub async fn load_room(&self, room_id: &str) -> Result<Option<Room>> {
        self.redis.get_json(&k_state(room_id)).await
    }

    pub async fn save_room(&self, room: &Room) -> Result<()> {
        self.redis.set_json(&k_state(&room.room_id), room).await
    }

    pub async fn room_exists(&self, room_id: &str) -> Result<bool> {
        self.redis.exists(&k_state(room_id)).await
    }

    pub async fn load_players(&self, room_id: &str) -> Result<Vec<Player>> {
        let mut players = Vec::new();
        for raw in self.redis.hvals(&k_players(room_id)).await? {
            players.push(serde_json::from_str(&raw)?);
        }
        players.sort_by_key(|p: &Player| (p.joined_at, p.user_id.clone()));
        Ok(players)
    }

    pub async fn get_player(&self, room_id: &str, user_id: &str) -> Result<Option<Player>> {
        match self.redis.hget(&k_players(room_id), user_id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_player(&self, room_id: &str, player: &Player) -> Result<()> {
        self.redis
            .hset(&k_players(room_id), &player.user_id, &serde_json::to_string(player)?)
            .await
    }

    pub async fn remove_player(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.redis.hdel(&k_players(room_id), user_id).await
    }

    pub async fn load_presence(&self, room_id: &str) -> Result<crate::presence::PresenceSet> {
        Ok(self.redis.get_json(&k_presence(room_id)).await?.unwrap_or_default())
    }

    pub async fn save_presence(
        &self,
        room_id: &str,
        presence: &crate::presence::PresenceSet,
    ) -> Result<()> {
        self.redis.set_json(&k_presence(room_id), presence).await
    }

    pub async fn load_canvas(&self, room_id: &str) -> Result<Option<crate::message::StrokeBatch>> {
        self.redis.get_json(&k_canvas(room_id)).await
    }

    pub async fn save_canvas(&self, room_id: &str, batch: &crate::message::StrokeBatch) -> Result<()> {
        self.redis.set_json(&k_canvas(room_id), batch).await
    }

    pub async fn clear_canvas(&self, room_id: &str) -> Result<()> {
        self.redis.del(&[k_canvas(room_id)]).await
    }

    pub async fn add_used_word(&self, room_id: &str, word: &str) -> Result<()> {
        self.redis.sadd(&k_used_words(room_id), word).await
    }

    pub async fn used_words(&self, room_id: &str) -> Result<HashSet<String>> {
        self.redis.smembers(&k_used_words(room_id)).await
    }

    pub async fn clear_used_words(&self, room_id: &str) -> Result<()> {
        self.redis.del(&[k_used_words(room_id)]).await
    }

    /// Record one vote; returns the distinct voters so far.
    pub async fn cast_kick_vote(
        &self,
        room_id: &str,
        target_id: &str,
        voter_id: &str,
    ) -> Result<HashSet<String>> {
        let key = k_kick(room_id, target_id);
        self.redis.sadd(&key, voter_id).await?;
        self.redis.smembers(&key).await
    }

    pub async fn clear_kick_votes(&self, room_id: &str, target_id: &str) -> Result<()> {
        self.redis.del(&[k_kick(room_id, target_id)]).await
    }

    /// Kicked players stay banned for the life of the room.
    pub async fn mark_kicked(&self, room_id: &str, user_id: &str) -> Result<()> {
        self.redis.sadd(&k_kicked(room_id), user_id).await
    }

    pub async fn is_kicked(&self, room_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.redis.smembers(&k_kicked(room_id)).await?.contains(user_id))
    }

    /// Arm the crash-safe turn deadline: the key expires when the phase
    /// does, and the expiry notification reaches every node.
    pub async fn arm_deadline(&self, room_id: &str, turn_token: u64, ttl_ms: u64) -> Result<()> {
        self.redis
            .set_px(&k_deadline(room_id), &turn_token.to_string(), ttl_ms)
            .await
    }

    pub async fn clear_deadline(&self, room_id: &str) -> Result<()> {
        self.redis.del(&[k_deadline(room_id)]).await
    }

    pub async fn add_public_room(&self, room_id: &str) -> Result<()> {
        self.redis.sadd(PUBLIC_ROOMS_KEY, room_id).await
    }

    pub async fn remove_public_room(&self, room_id: &str) -> Result<()> {
        self.redis.srem(PUBLIC_ROOMS_KEY, room_id).await
    }

    pub async fn public_rooms(&self) -> Result<HashSet<String>> {
        self.redis.smembers(PUBLIC_ROOMS_KEY).await
    }

    fn room_keys(room_id: &str) -> Vec<String> {
        vec![
            k_state(room_id),
            k_players(room_id),
            k_presence(room_id),
            k_canvas(room_id),
            k_used_words(room_id),
            k_kicked(room_id),
        ]
    }

    /// Start the idle countdown for an empty room.
    pub async fn expire_room(&self, room_id: &str, idle_ttl_secs: u64) -> Result<()> {
        for key in Self::room_keys(room_id) {
            self.redis.expire(&key, idle_ttl_secs).await?;
        }
        Ok(())
    }

    /// Cancel the idle countdown when someone comes back.
    pub async fn persist_room(&self, room_id: &str) -> Result<()> {
        for key in Self::room_keys(room_id) {
            self.redis.persist(&key).await?;
        }
        Ok(())
    }

    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        let mut keys = Self::room_keys(room_id);
        keys.push(k_deadline(room_id));
        self.redis.del(&keys).await?;
        self.redis.srem(PUBLIC_ROOMS_KEY, room_id).await
    }

    pub fn spawn_expiry_watch(&self, tx: flume::Sender<String>) {
        self.redis.spawn_expiry_watch(tx);
    }
}

/// `room:{id}:turn_deadline` -> `{id}`
pub fn room_of_deadline_key(key: &str) -> Option<&str> {
    key.strip_prefix("room:")?.strip_suffix(DEADLINE_SUFFIX)
}

/// `room:{id}:state` -> `{id}`
pub fn room_of_state_key(key: &str) -> Option<&str> {
    key.strip_prefix("room:")?.strip_suffix(STATE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_and_state_keys_parse_back_to_room_ids() {
        assert_eq!(room_of_deadline_key("room:happy-cat:turn_deadline"), Some("happy-cat"));
        assert_eq!(room_of_state_key("room:happy-cat:state"), Some("happy-cat"));
        assert_eq!(room_of_deadline_key("room:happy-cat:state"), None);
        assert_eq!(room_of_state_key("other:happy-cat:state"), None);
    }

    #[test]
    fn redis_urls_include_credentials_and_db() {
        let config = RedisConfig {
            host: "redis.internal".into(),
            port: 6380,
            db: 2,
            password: Some("hunter2".into()),
        };
        assert_eq!(config.url(), "redis://:hunter2@redis.internal:6380/2");

        let config = RedisConfig::default();
        assert_eq!(config.url(), "redis://127.0.0.1:6379/0");
    }
}
