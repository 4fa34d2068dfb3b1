//! The room engine. Every command follows the same discipline: take the
//! room's advisory lock, load the snapshot, run the pure transition from
//! `world`, write the result back, publish what happened. Timers re-enter
//! through `deadline_tick`/`hint_tick` and re-validate before acting, so
//! every path is idempotent.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde_json::Value;

use crate::bus::{room_topic, user_topic, Bus, Envelope};
use crate::guess::{self, GuessOutcome};
use crate::message::{
    PlayerScore, RoomInfoPayload, ServerEvent, StrokeBatch, TurnOverPayload, TurnStartedPayload,
};
use crate::presence::{PresenceMeta, PresenceSet, PresenceStatePayload};
use crate::scoring;
use crate::store::{RoomStore, StoreError};
use crate::words::WordCatalog;
use crate::world::{
    now_unix, now_unix_ms, Player, Room, RoomError, RoomSettings, RoomType, SettingsPatch,
    TurnEnd, TurnEndReason, TurnPhase, UserId,
};

use super::cli::Config;
use super::timers;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// bad payload or command not possible right now; replied as `error`
    #[error("{0}")]
    Validation(String),
    /// caller lacks the role the command needs
    #[error("not allowed")]
    Unauthorized,
    /// stale command racing a transition that already happened; the caller
    /// gets the current snapshot instead
    #[error("conflict")]
    Conflict,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RoomError> for EngineError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::NotAdmin | RoomError::NotDrawer => EngineError::Unauthorized,
            RoomError::WrongState => EngineError::Conflict,
            other => EngineError::Validation(other.to_string()),
        }
    }
}

/// What a freshly joined socket needs to render the room.
#[derive(Clone, Debug)]
pub struct JoinOutcome {
    pub room_info: RoomInfoPayload,
    pub presence: PresenceStatePayload,
    pub canvas: Option<StrokeBatch>,
    /// set when the joiner is the drawer mid-selection
    pub word_choices: Option<Vec<String>>,
    /// set when the joiner is the drawer mid-turn
    pub word: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub enum RelayKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Clone)]
pub struct RoomEngine {
    store: RoomStore,
    bus: Bus,
    words: Arc<WordCatalog>,
    config: Arc<Config>,
}

impl RoomEngine {
    pub fn new(store: RoomStore, bus: Bus, words: Arc<WordCatalog>, config: Arc<Config>) -> Self {
        Self {
            store,
            bus,
            words,
            config,
        }
    }

    pub fn config(&self) -> &Config { &self.config }

    // ---- socket lifecycle ------------------------------------------------

    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        name: String,
        avatar: Option<String>,
        room_type: Option<RoomType>,
        socket_ref: &str,
    ) -> Result<JoinOutcome> {
        let lock = self.store.lock(room_id).await?;
        let result = self
            .join_locked(room_id, user_id, name, avatar, room_type, socket_ref)
            .await;
        lock.release().await;
        result
    }

    async fn join_locked(
        &self,
        room_id: &str,
        user_id: &str,
        name: String,
        avatar: Option<String>,
        room_type: Option<RoomType>,
        socket_ref: &str,
    ) -> Result<JoinOutcome> {
        let now_ms = now_unix_ms();

        let mut room = match self.store.load_room(room_id).await? {
            Some(room) => {
                self.store.persist_room(room_id).await?;
                room
            }
            None => {
                let mut settings = RoomSettings::default();
                if let Some(room_type) = room_type {
                    settings.room_type = room_type;
                }
                let room = Room::new(room_id.to_owned(), settings);
                if room.settings.room_type == RoomType::Public {
                    self.store.add_public_room(room_id).await?;
                }
                log::info!("created room {}", room_id);
                room
            }
        };

        if self.store.is_kicked(room_id, user_id).await? {
            return Err(EngineError::Unauthorized);
        }

        let mut presence = self.store.load_presence(room_id).await?;
        if !presence.contains(user_id) && presence.len() >= room.settings.max_players as usize {
            return Err(EngineError::Validation("the room is full".to_owned()));
        }

        let mut player = match self.store.get_player(room_id, user_id).await? {
            Some(player) => player,
            None => Player::new(user_id.to_owned(), name.clone(), avatar.clone(), now_ms),
        };
        player.display_name = name;
        player.avatar = avatar;

        let meta = PresenceMeta {
            name: player.display_name.clone(),
            avatar: player.avatar.clone(),
            joined_at: now_ms,
            socket_ref: socket_ref.to_owned(),
        };
        let already_present = presence.contains(user_id);
        let diff = presence.join(user_id, meta);

        let mut admin_assigned = None;
        if room.admin_id.is_none() {
            room.admin_id = Some(user_id.to_owned());
            admin_assigned = Some(user_id.to_owned());
        }

        // only genuinely new players enter the rotation; a second socket of
        // someone who already drew this round must not re-queue them
        if !already_present {
            room.add_late_joiner(user_id);
        }

        self.store.put_player(room_id, &player).await?;
        self.store.save_presence(room_id, &presence).await?;
        self.store.save_room(&room).await?;

        self.publish_room(room_id, &ServerEvent::PresenceDiff(diff)).await?;
        if let Some(admin_id) = admin_assigned {
            self.publish_room(room_id, &ServerEvent::AdminChanged { admin_id }).await?;
        }
        let room_info = self.broadcast_room_info(&room).await?;

        let canvas = if room.is_active() {
            self.store.load_canvas(room_id).await?
        } else {
            None
        };
        let selecting = room.phase == Some(TurnPhase::SelectingWord);
        let drawing = room.phase == Some(TurnPhase::Drawing);

        Ok(JoinOutcome {
            room_info,
            presence: presence.state_payload(),
            canvas,
            word_choices: (selecting && room.is_drawer(user_id))
                .then(|| room.word_choices.clone()),
            word: (drawing && room.is_drawer(user_id))
                .then(|| room.current_word.clone())
                .flatten(),
        })
    }

    pub async fn leave(&self, room_id: &str, user_id: &str, socket_ref: &str) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.leave_locked(room_id, user_id, socket_ref).await;
        lock.release().await;
        result
    }

    async fn leave_locked(&self, room_id: &str, user_id: &str, socket_ref: &str) -> Result<()> {
        let mut room = match self.store.load_room(room_id).await? {
            Some(room) => room,
            None => return Ok(()),
        };
        let mut presence = self.store.load_presence(room_id).await?;

        let diff = match presence.leave(user_id, socket_ref) {
            Some(diff) => diff,
            // already gone, e.g. kicked before the socket closed
            None => return Ok(()),
        };
        self.publish_room(room_id, &ServerEvent::PresenceDiff(diff)).await?;

        if presence.contains(user_id) {
            // another socket of the same user is still here
            self.store.save_presence(room_id, &presence).await?;
            return Ok(());
        }

        self.depart_locked(&mut room, &presence, user_id).await?;

        self.store.save_presence(room_id, &presence).await?;
        self.store.save_room(&room).await?;

        if presence.is_empty() {
            self.store
                .expire_room(room_id, self.config.room_idle_ttl_secs)
                .await?;
            log::info!("room {} emptied, expiring in {}s", room_id, self.config.room_idle_ttl_secs);
        } else {
            self.broadcast_room_info(&room).await?;
        }
        Ok(())
    }

    /// Everything that happens when a player is gone for good: record and
    /// ballots dropped, rotation fixed up, admin re-elected, running turn
    /// ended. Presence must already exclude the player.
    async fn depart_locked(
        &self,
        room: &mut Room,
        presence: &PresenceSet,
        user_id: &str,
    ) -> Result<()> {
        let room_id = room.room_id.clone();

        self.store.remove_player(&room_id, user_id).await?;
        self.store.clear_kick_votes(&room_id, user_id).await?;

        let was_voice = room.voice_members.contains_key(user_id);
        let order = presence.ids_by_join_order();
        let outcome = room.remove_player(user_id, &order);

        if was_voice {
            self.publish_room(
                &room_id,
                &ServerEvent::VoiceStateChanged { voice_members: room.voice_members.clone() },
            )
            .await?;
        }

        if outcome.admin_vacated {
            if let Some(admin_id) = presence.earliest_joined() {
                room.admin_id = Some(admin_id.clone());
                self.publish_room(&room_id, &ServerEvent::AdminChanged { admin_id }).await?;
            }
        }

        if let Some(end) = outcome.turn_end {
            self.post_turn_effects(room, &end).await?;
        }
        if outcome.went_waiting {
            log::info!("room {} is back to waiting", room_id);
        }
        Ok(())
    }

    // ---- chat and guessing ----------------------------------------------

    pub async fn chat(&self, room_id: &str, user_id: &str, message: &str) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.chat_locked(room_id, user_id, message).await;
        lock.release().await;
        result
    }

    async fn chat_locked(&self, room_id: &str, user_id: &str, message: &str) -> Result<()> {
        let mut room = self.require_room(room_id).await?;
        let presence = self.store.load_presence(room_id).await?;
        if !presence.contains(user_id) {
            return Err(EngineError::Unauthorized);
        }

        let name = self
            .store
            .get_player(room_id, user_id)
            .await?
            .map(|p| p.display_name)
            .unwrap_or_else(|| user_id.to_owned());
        let chat_event = ServerEvent::NewMessage {
            user_id: user_id.to_owned(),
            name: name.clone(),
            message: message.to_owned(),
        };

        let guessing = room.is_active() && room.phase == Some(TurnPhase::Drawing);
        if !guessing {
            return self.publish_room(room_id, &chat_event).await;
        }

        let word = room.current_word.clone().unwrap_or_default();

        if room.is_drawer(user_id) {
            if guess::drawer_leaks_word(&word, message, &self.config.guess) {
                log::debug!("dropped a word-leaking drawer message in {}", room_id);
                return Ok(());
            }
            return self.publish_room(room_id, &chat_event).await;
        }

        let mut player = match self.store.get_player(room_id, user_id).await? {
            Some(player) => player,
            None => return Err(EngineError::Unauthorized),
        };

        if player.guessed_this_turn {
            // post-solve chatter stays among the solved and the drawer
            return self.publish_to_solved(&room, room_id, &chat_event).await;
        }

        match guess::evaluate(&word, message, &self.config.guess) {
            GuessOutcome::Miss => self.publish_room(room_id, &chat_event).await,
            GuessOutcome::Close => {
                self.publish_room(
                    room_id,
                    &ServerEvent::SimilarWord { user_id: user_id.to_owned(), name },
                )
                .await
            }
            GuessOutcome::Correct => {
                let now = now_unix();
                let time_left = room
                    .turn_deadline_unix
                    .map(|deadline| deadline.saturating_sub(now))
                    .unwrap_or(0);
                let points = scoring::guesser_points(
                    &self.config.scoring,
                    time_left,
                    u64::from(room.settings.turn_time_sec),
                );

                player.score += points;
                player.guessed_this_turn = true;
                player.guess_time_ms = Some(now_unix_ms());
                self.store.put_player(room_id, &player).await?;

                self.publish_room(
                    room_id,
                    &ServerEvent::CorrectGuess { user_id: user_id.to_owned(), name },
                )
                .await?;
                self.publish_room(
                    room_id,
                    &ServerEvent::ScoreUpdated {
                        user_id: user_id.to_owned(),
                        score: player.score,
                    },
                )
                .await?;

                if let Some(drawer_id) = room.current_drawer_id.clone() {
                    if let Some(mut drawer) = self.store.get_player(room_id, &drawer_id).await? {
                        drawer.score += scoring::drawer_bonus(&self.config.scoring, points);
                        self.store.put_player(room_id, &drawer).await?;
                        self.publish_room(
                            room_id,
                            &ServerEvent::ScoreUpdated {
                                user_id: drawer_id,
                                score: drawer.score,
                            },
                        )
                        .await?;
                    }
                }

                let players = self.store.load_players(room_id).await?;
                let all_guessed = players
                    .iter()
                    .filter(|p| presence.contains(&p.user_id) && !room.is_drawer(&p.user_id))
                    .all(|p| p.guessed_this_turn);

                if all_guessed {
                    let order = presence.ids_by_join_order();
                    self.finish_turn(&mut room, TurnEndReason::AllGuessed, &order).await?;
                    self.store.save_room(&room).await?;
                    self.broadcast_room_info(&room).await?;
                }
                Ok(())
            }
        }
    }

    async fn publish_to_solved(
        &self,
        room: &Room,
        room_id: &str,
        event: &ServerEvent,
    ) -> Result<()> {
        let players = self.store.load_players(room_id).await?;
        for player in players {
            if player.guessed_this_turn || room.is_drawer(&player.user_id) {
                self.publish_user(&player.user_id, event).await?;
            }
        }
        Ok(())
    }

    // ---- canvas relay ----------------------------------------------------

    pub async fn draw(
        &self,
        room_id: &str,
        user_id: &str,
        batch: StrokeBatch,
        socket_ref: &str,
    ) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.draw_locked(room_id, user_id, batch, socket_ref).await;
        lock.release().await;
        result
    }

    async fn draw_locked(
        &self,
        room_id: &str,
        user_id: &str,
        batch: StrokeBatch,
        socket_ref: &str,
    ) -> Result<()> {
        let room = self.require_room(room_id).await?;
        if !room.is_active() || room.phase != Some(TurnPhase::Drawing) {
            return Err(EngineError::Conflict);
        }
        if !room.is_drawer(user_id) {
            return Err(EngineError::Unauthorized);
        }

        self.store.save_canvas(room_id, &batch).await?;
        self.publish_room_except(room_id, &ServerEvent::Drawing(batch), socket_ref)
            .await
    }

    pub async fn clear_canvas(
        &self,
        room_id: &str,
        user_id: &str,
        socket_ref: &str,
    ) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = async {
            let room = self.require_room(room_id).await?;
            if !room.is_drawer(user_id) {
                return Err(EngineError::Unauthorized);
            }
            self.store.clear_canvas(room_id).await?;
            self.publish_room_except(room_id, &ServerEvent::DrawingClear {}, socket_ref)
                .await
        }
        .await;
        lock.release().await;
        result
    }

    // ---- game flow -------------------------------------------------------

    pub async fn start_game(&self, room_id: &str, caller: &str) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.start_game_locked(room_id, caller).await;
        lock.release().await;
        result
    }

    async fn start_game_locked(&self, room_id: &str, caller: &str) -> Result<()> {
        let mut room = self.require_room(room_id).await?;
        let presence = self.store.load_presence(room_id).await?;
        let order = presence.ids_by_join_order();

        room.start_game(caller, &order)?;

        // a fresh game starts from zero
        let players = self.store.load_players(room_id).await?;
        for mut player in players {
            player.reset_game();
            self.store.put_player(room_id, &player).await?;
        }
        self.store.clear_used_words(room_id).await?;
        self.store.clear_canvas(room_id).await?;

        self.publish_room(room_id, &ServerEvent::GameStarted { round: room.current_round })
            .await?;
        self.open_selection_effects(&mut room).await?;

        self.store.save_room(&room).await?;
        self.broadcast_room_info(&room).await?;
        Ok(())
    }

    pub async fn start_turn(&self, room_id: &str, caller: &str, word: &str) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.start_turn_locked(room_id, caller, word).await;
        lock.release().await;
        result
    }

    async fn start_turn_locked(&self, room_id: &str, caller: &str, word: &str) -> Result<()> {
        let mut room = self.require_room(room_id).await?;
        if !room.is_drawer(caller) {
            return Err(EngineError::Unauthorized);
        }
        if room.phase != Some(TurnPhase::SelectingWord) {
            return Err(EngineError::Conflict);
        }

        let word = word.trim().to_lowercase();
        if !room.word_choices.iter().any(|choice| choice == &word) {
            return Err(EngineError::Validation(RoomError::WordNotOffered.to_string()));
        }

        room.begin_turn(&word, now_unix())?;
        self.begin_turn_effects(&mut room).await?;

        self.store.save_room(&room).await?;
        self.broadcast_room_info(&room).await?;
        Ok(())
    }

    pub async fn skip_words(&self, room_id: &str, caller: &str) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.skip_words_locked(room_id, caller).await;
        lock.release().await;
        result
    }

    async fn skip_words_locked(&self, room_id: &str, caller: &str) -> Result<()> {
        let mut room = self.require_room(room_id).await?;
        room.use_skip(caller)?;

        let mut excluded = self.store.used_words(room_id).await?;
        excluded.extend(room.word_choices.iter().cloned());
        let suggestion = self.words.suggest(room.settings.difficulty, &excluded);
        if suggestion.pool_reset {
            self.store.clear_used_words(room_id).await?;
        }
        room.offer_words(suggestion.words.clone());

        self.store.save_room(&room).await?;
        self.publish_user(caller, &ServerEvent::SelectWord { words: suggestion.words })
            .await?;
        Ok(())
    }

    pub async fn update_settings(
        &self,
        room_id: &str,
        caller: &str,
        patch: SettingsPatch,
    ) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.update_settings_locked(room_id, caller, patch).await;
        lock.release().await;
        result
    }

    async fn update_settings_locked(
        &self,
        room_id: &str,
        caller: &str,
        patch: SettingsPatch,
    ) -> Result<()> {
        let mut room = self.require_room(room_id).await?;

        match room.apply_settings(caller, &patch) {
            Err(RoomError::WrongState) => {
                return Err(EngineError::Validation(
                    "room settings can only be changed before the game starts".to_owned(),
                ))
            }
            other => other?,
        }

        // public/private flips move the room in and out of random matching
        match room.settings.room_type {
            RoomType::Public => self.store.add_public_room(room_id).await?,
            RoomType::Private => self.store.remove_public_room(room_id).await?,
        }

        self.store.save_room(&room).await?;
        self.publish_room(
            room_id,
            &ServerEvent::RoomSettingsUpdated { settings: room.settings.clone() },
        )
        .await?;
        self.broadcast_room_info(&room).await?;
        Ok(())
    }

    // ---- kick ballots ----------------------------------------------------

    pub async fn vote_to_kick(&self, room_id: &str, voter: &str, target: &str) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.vote_to_kick_locked(room_id, voter, target).await;
        lock.release().await;
        result
    }

    async fn vote_to_kick_locked(&self, room_id: &str, voter: &str, target: &str) -> Result<()> {
        let mut room = self.require_room(room_id).await?;
        let mut presence = self.store.load_presence(room_id).await?;

        if voter == target {
            return Err(EngineError::Validation("you cannot vote against yourself".to_owned()));
        }
        if !presence.contains(voter) || !presence.contains(target) {
            return Err(EngineError::Unauthorized);
        }

        let voters = self.store.cast_kick_vote(room_id, target, voter).await?;
        let present: HashSet<UserId> = presence.ids_by_join_order().into_iter().collect();
        let distinct = voters.iter().filter(|v| present.contains(*v)).count();
        let threshold = present.len().div_ceil(2);

        log::debug!(
            "kick ballot in {}: {}/{} votes against {}",
            room_id, distinct, threshold, target
        );
        if distinct < threshold {
            return Ok(());
        }

        // threshold reached: the target goes, the ballot dies with them
        self.store.mark_kicked(room_id, target).await?;
        let kicked = ServerEvent::PlayerKicked { user_id: target.to_owned() };
        self.publish_room(room_id, &kicked).await?;
        self.publish_user(target, &kicked).await?;

        if let Some(diff) = presence.remove_user(target) {
            self.publish_room(room_id, &ServerEvent::PresenceDiff(diff)).await?;
        }
        self.depart_locked(&mut room, &presence, target).await?;

        self.store.save_presence(room_id, &presence).await?;
        self.store.save_room(&room).await?;

        if presence.is_empty() {
            self.store
                .expire_room(room_id, self.config.room_idle_ttl_secs)
                .await?;
        } else {
            self.broadcast_room_info(&room).await?;
        }
        Ok(())
    }

    // ---- voice -----------------------------------------------------------

    pub async fn voice_update(
        &self,
        room_id: &str,
        user_id: &str,
        update: VoiceUpdate,
    ) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = async {
            let mut room = self.require_room(room_id).await?;
            let presence = self.store.load_presence(room_id).await?;
            if !presence.contains(user_id) {
                return Err(EngineError::Unauthorized);
            }

            match update {
                VoiceUpdate::Join => {
                    room.voice_members.insert(user_id.to_owned(), false);
                }
                VoiceUpdate::Leave => {
                    room.voice_members.remove(user_id);
                }
                VoiceUpdate::Mute(muted) => {
                    room.voice_members.insert(user_id.to_owned(), muted);
                }
            }

            self.store.save_room(&room).await?;
            self.publish_room(
                room_id,
                &ServerEvent::VoiceStateChanged { voice_members: room.voice_members.clone() },
            )
            .await
        }
        .await;
        lock.release().await;
        result
    }

    /// Forward an SDP/ICE payload to all sockets of the named peer. The
    /// payload stays opaque apart from the routing field and the sender id
    /// stamped in.
    pub async fn webrtc_relay(
        &self,
        room_id: &str,
        from: &str,
        kind: RelayKind,
        mut payload: Value,
    ) -> Result<()> {
        let target = payload
            .get("target_user_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| EngineError::Validation("target_user_id is required".to_owned()))?;

        let presence = self.store.load_presence(room_id).await?;
        if !presence.contains(from) || !presence.contains(&target) {
            return Err(EngineError::Unauthorized);
        }

        if let Value::Object(map) = &mut payload {
            map.insert("from_user_id".to_owned(), Value::String(from.to_owned()));
        }

        let event = match kind {
            RelayKind::Offer => ServerEvent::WebrtcOffer(payload),
            RelayKind::Answer => ServerEvent::WebrtcAnswer(payload),
            RelayKind::IceCandidate => ServerEvent::WebrtcIceCandidate(payload),
        };
        self.publish_user(&target, &event).await
    }

    // ---- timer entry points (called from timers.rs) ----------------------

    /// Shared handler for the word-pick deadline and the turn deadline.
    /// `token = None` is the crash-recovery path driven by the expired
    /// sentinel key; it validates against the stored deadline instead.
    pub(super) async fn deadline_tick(&self, room_id: &str, token: Option<u64>) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = self.deadline_tick_locked(room_id, token).await;
        lock.release().await;
        result
    }

    async fn deadline_tick_locked(&self, room_id: &str, token: Option<u64>) -> Result<()> {
        let mut room = match self.store.load_room(room_id).await? {
            Some(room) => room,
            None => return Ok(()),
        };
        if !room.is_active() || room.phase.is_none() {
            return Ok(());
        }

        let valid = match token {
            Some(token) => token == room.turn_token,
            None => room
                .turn_deadline_unix
                .map(|deadline| now_unix() + 1 >= deadline)
                .unwrap_or(false),
        };
        if !valid {
            // a newer phase owns the clock now
            return Ok(());
        }

        match room.phase {
            Some(TurnPhase::SelectingWord) => {
                // drawer never picked: take the first suggestion
                let word = match room.word_choices.first().cloned() {
                    Some(word) => word,
                    None => {
                        let used = self.store.used_words(room_id).await?;
                        let suggestion = self.words.suggest(room.settings.difficulty, &used);
                        suggestion.words.into_iter().next().unwrap_or_default()
                    }
                };

                if let Some(drawer_id) = room.current_drawer_id.clone() {
                    self.publish_user(
                        &drawer_id,
                        &ServerEvent::WordAutoSelected { word: word.clone() },
                    )
                    .await?;
                }
                log::info!("auto-selected a word in {}", room_id);

                room.begin_turn(&word, now_unix())?;
                self.begin_turn_effects(&mut room).await?;
            }
            Some(TurnPhase::Drawing) => {
                let presence = self.store.load_presence(room_id).await?;
                let order = presence.ids_by_join_order();
                self.finish_turn(&mut room, TurnEndReason::Timeout, &order).await?;
            }
            None => return Ok(()),
        }

        self.store.save_room(&room).await?;
        self.broadcast_room_info(&room).await?;
        Ok(())
    }

    pub(super) async fn hint_tick(&self, room_id: &str, token: u64) -> Result<()> {
        let lock = self.store.lock(room_id).await?;
        let result = async {
            let mut room = match self.store.load_room(room_id).await? {
                Some(room) => room,
                None => return Ok(()),
            };
            let running = room.is_active()
                && room.phase == Some(TurnPhase::Drawing)
                && room.turn_token == token
                && room.settings.hints_allowed;
            if !running {
                return Ok(());
            }

            let candidates = room.reveal_candidates();
            let index = match candidates.choose(&mut rand::thread_rng()) {
                Some(index) => *index,
                None => return Ok(()),
            };
            let letter = match room.reveal_index(index) {
                Some(letter) => letter,
                None => return Ok(()),
            };

            self.store.save_room(&room).await?;
            self.publish_room(
                room_id,
                &ServerEvent::LetterReveal { index, letter: letter.to_string() },
            )
            .await
        }
        .await;
        lock.release().await;
        result
    }

    /// Persistent store failures stop the room from scheduling new turns.
    pub(super) async fn mark_degraded(&self, room_id: &str) {
        let result = async {
            let lock = self.store.lock(room_id).await?;
            if let Some(mut room) = self.store.load_room(room_id).await? {
                room.degraded = true;
                self.store.save_room(&room).await?;
            }
            lock.release().await;
            Ok::<_, EngineError>(())
        }
        .await;

        match result {
            Ok(()) => log::error!("room {} marked degraded, no new turns", room_id),
            Err(err) => log::error!("could not mark room {} degraded: {}", room_id, err),
        }
    }

    /// The state key of an emptied room expired: drop whatever is left.
    pub async fn cleanup_room(&self, room_id: &str) -> Result<()> {
        self.store.delete_room(room_id).await?;
        log::info!("room {} expired and was deleted", room_id);
        Ok(())
    }

    // ---- read-only -------------------------------------------------------

    pub async fn room_snapshot(&self, room_id: &str) -> Result<RoomInfoPayload> {
        let room = self.require_room(room_id).await?;
        let players = self.store.load_players(room_id).await?;
        Ok(RoomInfoPayload::new(&room, &players))
    }

    // ---- shared turn machinery -------------------------------------------

    /// Effects of entering `selecting_word` with a drawer assigned: deal the
    /// word choices, start the pick clock, tell the room and the drawer.
    async fn open_selection_effects(&self, room: &mut Room) -> Result<()> {
        if room.degraded {
            // no new turns in a degraded room; it stays parked here
            log::warn!("room {} is degraded, not opening a new turn", room.room_id);
            return Ok(());
        }
        let drawer_id = match room.current_drawer_id.clone() {
            Some(drawer_id) => drawer_id,
            None => return Ok(()),
        };
        let room_id = room.room_id.clone();

        let used = self.store.used_words(&room_id).await?;
        let suggestion = self.words.suggest(room.settings.difficulty, &used);
        if suggestion.pool_reset {
            self.store.clear_used_words(&room_id).await?;
        }
        room.offer_words(suggestion.words.clone());

        let pick_secs = self.config.timers.word_pick_secs;
        room.turn_deadline_unix = Some(now_unix() + pick_secs);
        self.store
            .arm_deadline(&room_id, room.turn_token, pick_secs * 1_000)
            .await?;

        self.publish_room(
            &room_id,
            &ServerEvent::DrawerAssigned {
                drawer_id: drawer_id.clone(),
                round: room.current_round,
            },
        )
        .await?;
        self.publish_user(&drawer_id, &ServerEvent::SelectWord { words: suggestion.words })
            .await?;

        timers::spawn_deadline_timer(self.clone(), room_id, room.turn_token, pick_secs);
        Ok(())
    }

    /// Effects of entering `drawing`: canvas wiped, guess flags reset, the
    /// authoritative clock armed, hint ticks scheduled.
    async fn begin_turn_effects(&self, room: &mut Room) -> Result<()> {
        let room_id = room.room_id.clone();
        let word = room.current_word.clone().unwrap_or_default();
        let turn_time = u64::from(room.settings.turn_time_sec);

        self.store.add_used_word(&room_id, &word).await?;
        self.store.clear_canvas(&room_id).await?;

        let players = self.store.load_players(&room_id).await?;
        for mut player in players {
            player.reset_turn();
            self.store.put_player(&room_id, &player).await?;
        }

        self.store
            .arm_deadline(&room_id, room.turn_token, turn_time * 1_000)
            .await?;

        let drawer_id = room.current_drawer_id.clone().unwrap_or_default();
        self.publish_room(
            &room_id,
            &ServerEvent::TurnStarted(TurnStartedPayload {
                drawer_id,
                round: room.current_round,
                turn_time_sec: room.settings.turn_time_sec,
                word_mask: room.masked_word().unwrap_or_default(),
                special_chars: room.special_chars(),
                turn_deadline_unix: room.turn_deadline_unix.unwrap_or_default(),
            }),
        )
        .await?;

        timers::spawn_deadline_timer(self.clone(), room_id.clone(), room.turn_token, turn_time);
        if room.settings.hints_allowed {
            timers::spawn_hint_timers(self.clone(), room_id, room.turn_token, turn_time);
        }
        Ok(())
    }

    async fn finish_turn(
        &self,
        room: &mut Room,
        reason: TurnEndReason,
        present_order: &[UserId],
    ) -> Result<()> {
        let end = room.end_turn(reason, present_order)?;
        self.post_turn_effects(room, &end).await
    }

    /// Everything after the pure `end_turn` transition: clocks cleared,
    /// scores announced, and either the next selection or the game-over.
    async fn post_turn_effects(&self, room: &mut Room, end: &TurnEnd) -> Result<()> {
        let room_id = room.room_id.clone();
        log::debug!(
            "turn of {:?} in {} ended: {}",
            end.drawer_id, room_id, end.reason
        );

        self.store.clear_deadline(&room_id).await?;
        self.store.clear_canvas(&room_id).await?;
        if end.new_round {
            // the no-repeat set is scoped to one round
            self.store.clear_used_words(&room_id).await?;
            log::info!("round {} begins in {}", room.current_round, room_id);
        }

        let players = self.store.load_players(&room_id).await?;
        let scores = player_scores(&players);

        self.publish_room(
            &room_id,
            &ServerEvent::TurnOver(TurnOverPayload {
                reason: end.reason,
                word: end.word.clone(),
                scores: scores.clone(),
            }),
        )
        .await?;

        if end.game_over {
            self.publish_room(&room_id, &ServerEvent::GameOver { scores }).await?;
            log::info!("game over in {}", room_id);
        } else if room.phase == Some(TurnPhase::SelectingWord) {
            self.open_selection_effects(room).await?;
        }
        Ok(())
    }

    // ---- publishing ------------------------------------------------------

    async fn publish_room(&self, room_id: &str, event: &ServerEvent) -> Result<()> {
        self.bus
            .publish(&room_topic(room_id), &Envelope::from_event(event))
            .await?;
        Ok(())
    }

    async fn publish_room_except(
        &self,
        room_id: &str,
        event: &ServerEvent,
        socket_ref: &str,
    ) -> Result<()> {
        self.bus
            .publish(&room_topic(room_id), &Envelope::from_event_except(event, socket_ref))
            .await?;
        Ok(())
    }

    async fn publish_user(&self, user_id: &str, event: &ServerEvent) -> Result<()> {
        self.bus
            .publish(&user_topic(user_id), &Envelope::from_event(event))
            .await?;
        Ok(())
    }

    async fn broadcast_room_info(&self, room: &Room) -> Result<RoomInfoPayload> {
        let players = self.store.load_players(&room.room_id).await?;
        let payload = RoomInfoPayload::new(room, &players);
        self.publish_room(&room.room_id, &ServerEvent::RoomInfo(payload.clone()))
            .await?;
        Ok(payload)
    }

    async fn require_room(&self, room_id: &str) -> Result<Room> {
        self.store
            .load_room(room_id)
            .await?
            .ok_or(EngineError::Conflict)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum VoiceUpdate {
    Join,
    Leave,
    Mute(bool),
}

fn player_scores(players: &[Player]) -> Vec<PlayerScore> {
    let mut scores: Vec<PlayerScore> = players
        .iter()
        .map(|p| PlayerScore {
            user_id: p.user_id.clone(),
            name: p.display_name.clone(),
            score: p.score,
        })
        .collect();
    scores.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    scores
}
