use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub type UserId = String;

/// Minimum number of present players for a game to run.
pub const MIN_PLAYERS: usize = 2;

pub const MAX_PLAYERS_RANGE: std::ops::RangeInclusive<u8> = 2..=8;
pub const MAX_ROUNDS_CHOICES: [u32; 5] = [1, 2, 3, 5, 10];
pub const TURN_TIME_CHOICES: [u32; 5] = [30, 45, 60, 90, 120];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Waiting,
    Active,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    SelectingWord,
    Drawing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Public,
    Private,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEndReason {
    AllGuessed,
    Timeout,
    DrawerLeft,
}

impl Display for TurnEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnEndReason::AllGuessed => write!(f, "all_guessed"),
            TurnEndReason::Timeout => write!(f, "timeout"),
            TurnEndReason::DrawerLeft => write!(f, "drawer_left"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub max_players: u8,
    pub max_rounds: u32,
    pub turn_time_sec: u32,
    pub hints_allowed: bool,
    pub difficulty: Difficulty,
    pub room_type: RoomType,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_players: 8,
            max_rounds: 3,
            turn_time_sec: 60,
            hints_allowed: true,
            difficulty: Difficulty::Medium,
            room_type: RoomType::Public,
        }
    }
}

/// Partial settings update as sent by `update_room_settings`; unset fields
/// keep their current value.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SettingsPatch {
    pub max_players: Option<u8>,
    pub max_rounds: Option<u32>,
    pub turn_time_sec: Option<u32>,
    pub hints_allowed: Option<bool>,
    pub difficulty: Option<Difficulty>,
    pub room_type: Option<RoomType>,
}

impl RoomSettings {
    pub fn merged_with(&self, patch: &SettingsPatch) -> RoomSettings {
        RoomSettings {
            max_players: patch.max_players.unwrap_or(self.max_players),
            max_rounds: patch.max_rounds.unwrap_or(self.max_rounds),
            turn_time_sec: patch.turn_time_sec.unwrap_or(self.turn_time_sec),
            hints_allowed: patch.hints_allowed.unwrap_or(self.hints_allowed),
            difficulty: patch.difficulty.unwrap_or(self.difficulty),
            room_type: patch.room_type.unwrap_or(self.room_type),
        }
    }

    pub fn validate(&self) -> Result<(), RoomError> {
        if !MAX_PLAYERS_RANGE.contains(&self.max_players) {
            return Err(RoomError::InvalidSettings("max_players must be 2-8"));
        }
        if !MAX_ROUNDS_CHOICES.contains(&self.max_rounds) {
            return Err(RoomError::InvalidSettings(
                "max_rounds must be one of 1, 2, 3, 5, 10",
            ));
        }
        if !TURN_TIME_CHOICES.contains(&self.turn_time_sec) {
            return Err(RoomError::InvalidSettings(
                "turn_time_sec must be one of 30, 45, 60, 90, 120",
            ));
        }
        Ok(())
    }
}

/// The data the server stores for every player in a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Player {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub joined_at: u64,
    pub score: u32,
    pub guessed_this_turn: bool,
    pub guess_time_ms: Option<u64>,
}

impl Player {
    pub fn new(user_id: UserId, display_name: String, avatar: Option<String>, joined_at: u64) -> Self {
        Self {
            user_id,
            display_name,
            avatar,
            joined_at,
            score: 0,
            guessed_this_turn: false,
            guess_time_ms: None,
        }
    }

    pub fn reset_turn(&mut self) {
        self.guessed_this_turn = false;
        self.guess_time_ms = None;
    }

    pub fn reset_game(&mut self) {
        self.score = 0;
        self.reset_turn();
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("only the room admin may do that")]
    NotAdmin,
    #[error("only the current drawer may do that")]
    NotDrawer,
    #[error("at least {MIN_PLAYERS} players are required")]
    NotEnoughPlayers,
    #[error("the room is full")]
    RoomFull,
    #[error("that is not possible in the room's current state")]
    WrongState,
    #[error("the word is not among the current suggestions")]
    WordNotOffered,
    #[error("the word skip has already been used this turn")]
    SkipExhausted,
    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),
}

/// What a finished turn leaves behind.
#[derive(Clone, Debug)]
pub struct TurnEnd {
    pub reason: TurnEndReason,
    pub word: Option<String>,
    /// the drawer whose turn just ended
    pub drawer_id: Option<UserId>,
    pub game_over: bool,
    /// the drawer of the next turn, when the game goes on
    pub next_drawer_id: Option<UserId>,
    pub new_round: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RemovalOutcome {
    pub turn_end: Option<TurnEnd>,
    pub went_waiting: bool,
    pub admin_vacated: bool,
}

/// A non-alphabetic character of the word, always shown to guessers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpecialChar {
    pub index: usize,
    pub ch: char,
}

/// Snapshot of one room. The engine loads it from the store, mutates it
/// through these methods while holding the room lock, and writes it back;
/// nothing in here touches the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub status: RoomStatus,
    pub settings: RoomSettings,
    pub admin_id: Option<UserId>,
    pub current_round: u32,
    pub phase: Option<TurnPhase>,
    pub current_drawer_id: Option<UserId>,
    pub current_word: Option<String>,
    pub word_choices: Vec<String>,
    pub skip_used: bool,
    pub turn_deadline_unix: Option<u64>,
    /// fences stale timers: bumped on every phase change
    pub turn_token: u64,
    pub drawer_queue: VecDeque<UserId>,
    pub revealed_indices: Vec<usize>,
    pub voice_members: BTreeMap<UserId, bool>,
    #[serde(default)]
    pub degraded: bool,
}

impl Room {
    pub fn new(room_id: String, settings: RoomSettings) -> Self {
        Self {
            room_id,
            status: RoomStatus::Waiting,
            settings,
            admin_id: None,
            current_round: 0,
            phase: None,
            current_drawer_id: None,
            current_word: None,
            word_choices: Vec::new(),
            skip_used: false,
            turn_deadline_unix: None,
            turn_token: 0,
            drawer_queue: VecDeque::new(),
            revealed_indices: Vec::new(),
            voice_members: BTreeMap::new(),
            degraded: false,
        }
    }

    pub fn is_active(&self) -> bool { self.status == RoomStatus::Active }

    pub fn is_drawer(&self, user_id: &str) -> bool {
        self.current_drawer_id.as_deref() == Some(user_id)
    }

    /// `waiting|finished -> active(selecting_word)`; requires the admin, and
    /// enough players. Starting again from `finished` begins a fresh game.
    pub fn start_game(&mut self, caller: &str, present_order: &[UserId]) -> Result<(), RoomError> {
        if self.admin_id.as_deref() != Some(caller) {
            return Err(RoomError::NotAdmin);
        }
        if matches!(self.status, RoomStatus::Active) {
            return Err(RoomError::WrongState);
        }
        if present_order.len() < MIN_PLAYERS {
            return Err(RoomError::NotEnoughPlayers);
        }
        if self.degraded {
            return Err(RoomError::WrongState);
        }

        self.status = RoomStatus::Active;
        self.current_round = 1;
        self.drawer_queue = present_order.iter().cloned().collect();
        self.open_selection();
        Ok(())
    }

    /// Pull the next drawer off the queue and enter `selecting_word`.
    /// Callers guarantee the queue is non-empty.
    fn open_selection(&mut self) {
        self.current_drawer_id = self.drawer_queue.pop_front();
        self.phase = Some(TurnPhase::SelectingWord);
        self.current_word = None;
        self.word_choices.clear();
        self.skip_used = false;
        self.revealed_indices.clear();
        self.turn_deadline_unix = None;
        self.turn_token += 1;
    }

    /// `active(selecting_word) -> active(drawing)` with the chosen word.
    pub fn begin_turn(&mut self, word: &str, now_unix: u64) -> Result<(), RoomError> {
        if self.phase != Some(TurnPhase::SelectingWord) {
            return Err(RoomError::WrongState);
        }

        self.current_word = Some(word.trim().to_lowercase());
        self.word_choices.clear();
        self.phase = Some(TurnPhase::Drawing);
        self.turn_deadline_unix = Some(now_unix + u64::from(self.settings.turn_time_sec));
        self.revealed_indices.clear();
        self.turn_token += 1;
        Ok(())
    }

    /// End the running turn and advance the rotation. `present_order` is the
    /// presence set ordered by join time, used to rebuild the queue at a
    /// round boundary.
    pub fn end_turn(
        &mut self,
        reason: TurnEndReason,
        present_order: &[UserId],
    ) -> Result<TurnEnd, RoomError> {
        if !self.is_active() || self.phase.is_none() {
            return Err(RoomError::WrongState);
        }

        let word = self.current_word.take();
        let drawer_id = self.current_drawer_id.take();
        self.word_choices.clear();
        self.skip_used = false;
        self.turn_deadline_unix = None;
        self.revealed_indices.clear();
        self.turn_token += 1;

        if present_order.len() < MIN_PLAYERS {
            self.to_waiting();
            return Ok(TurnEnd {
                reason,
                word,
                drawer_id,
                game_over: false,
                next_drawer_id: None,
                new_round: false,
            });
        }

        // skip queued players who are no longer present
        while matches!(self.drawer_queue.front(), Some(id) if !present_order.contains(id)) {
            self.drawer_queue.pop_front();
        }

        let mut new_round = false;
        if self.drawer_queue.is_empty() {
            self.current_round += 1;
            if self.current_round > self.settings.max_rounds {
                self.status = RoomStatus::Finished;
                self.phase = None;
                return Ok(TurnEnd {
                    reason,
                    word,
                    drawer_id,
                    game_over: true,
                    next_drawer_id: None,
                    new_round: false,
                });
            }
            new_round = true;
            self.drawer_queue = present_order.iter().cloned().collect();
        }

        self.open_selection();
        Ok(TurnEnd {
            reason,
            word,
            drawer_id,
            game_over: false,
            next_drawer_id: self.current_drawer_id.clone(),
            new_round,
        })
    }

    fn to_waiting(&mut self) {
        self.status = RoomStatus::Waiting;
        self.current_round = 0;
        self.phase = None;
        self.current_drawer_id = None;
        self.current_word = None;
        self.word_choices.clear();
        self.skip_used = false;
        self.turn_deadline_unix = None;
        self.drawer_queue.clear();
        self.revealed_indices.clear();
        self.turn_token += 1;
    }

    /// A player joining mid-game draws later this round.
    pub fn add_late_joiner(&mut self, user_id: &str) {
        if self.is_active()
            && !self.is_drawer(user_id)
            && !self.drawer_queue.iter().any(|id| id == user_id)
        {
            self.drawer_queue.push_back(user_id.to_owned());
        }
    }

    /// Remove a player who left the room. `present_after` is the presence
    /// set (ordered by join time) once the player is gone.
    pub fn remove_player(&mut self, user_id: &str, present_after: &[UserId]) -> RemovalOutcome {
        let mut outcome = RemovalOutcome::default();

        self.drawer_queue.retain(|id| id != user_id);
        self.voice_members.remove(user_id);

        if self.admin_id.as_deref() == Some(user_id) {
            self.admin_id = None;
            outcome.admin_vacated = true;
        }

        let was_drawer = self.is_drawer(user_id);
        let turn_running = self.is_active() && self.phase.is_some();

        if turn_running && (was_drawer || present_after.len() < MIN_PLAYERS) {
            outcome.turn_end = self.end_turn(TurnEndReason::DrawerLeft, present_after).ok();
        } else if self.is_active() && present_after.len() < MIN_PLAYERS {
            self.to_waiting();
        }

        if self.status == RoomStatus::Waiting {
            outcome.went_waiting = true;
        }
        outcome
    }

    /// Admin-only, lobby-only settings change.
    pub fn apply_settings(&mut self, caller: &str, patch: &SettingsPatch) -> Result<(), RoomError> {
        if self.admin_id.as_deref() != Some(caller) {
            return Err(RoomError::NotAdmin);
        }
        if self.status != RoomStatus::Waiting {
            return Err(RoomError::WrongState);
        }

        let merged = self.settings.merged_with(patch);
        merged.validate()?;
        self.settings = merged;
        Ok(())
    }

    pub fn offer_words(&mut self, words: Vec<String>) { self.word_choices = words; }

    pub fn use_skip(&mut self, caller: &str) -> Result<(), RoomError> {
        if !self.is_drawer(caller) {
            return Err(RoomError::NotDrawer);
        }
        if self.phase != Some(TurnPhase::SelectingWord) {
            return Err(RoomError::WrongState);
        }
        if self.skip_used {
            return Err(RoomError::SkipExhausted);
        }
        self.skip_used = true;
        Ok(())
    }

    /// The guesser view of the word: revealed and non-alphabetic characters
    /// shown, everything else masked.
    pub fn masked_word(&self) -> Option<String> {
        self.current_word.as_ref().map(|word| {
            word.chars()
                .enumerate()
                .map(|(idx, ch)| {
                    if !ch.is_alphabetic() || self.revealed_indices.contains(&idx) {
                        ch
                    } else {
                        '_'
                    }
                })
                .collect()
        })
    }

    pub fn special_chars(&self) -> Vec<SpecialChar> {
        self.current_word
            .as_deref()
            .unwrap_or_default()
            .chars()
            .enumerate()
            .filter(|(_, ch)| !ch.is_alphabetic())
            .map(|(index, ch)| SpecialChar { index, ch })
            .collect()
    }

    /// Alphabetic indices a hint tick may still disclose. Reveals stop once
    /// half of the letters are out.
    pub fn reveal_candidates(&self) -> Vec<usize> {
        let word = match self.current_word.as_deref() {
            Some(word) => word,
            None => return Vec::new(),
        };

        let alpha_total = word.chars().filter(|ch| ch.is_alphabetic()).count();
        if self.revealed_indices.len() >= alpha_total / 2 {
            return Vec::new();
        }

        word.chars()
            .enumerate()
            .filter(|(idx, ch)| ch.is_alphabetic() && !self.revealed_indices.contains(idx))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn reveal_index(&mut self, index: usize) -> Option<char> {
        let ch = self.current_word.as_ref()?.chars().nth(index)?;
        if !self.revealed_indices.contains(&index) {
            self.revealed_indices.push(index);
        }
        Some(ch)
    }
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<UserId> { names.iter().map(|s| s.to_string()).collect() }

    fn room_with_players(players: &[&str]) -> Room {
        let mut room = Room::new("happy-cat".into(), RoomSettings::default());
        room.admin_id = Some(players[0].to_string());
        room
    }

    #[test]
    fn start_game_requires_admin_and_two_players() {
        let mut room = room_with_players(&["a", "b", "c"]);

        assert_eq!(
            room.start_game("b", &ids(&["a", "b", "c"])),
            Err(RoomError::NotAdmin)
        );
        assert_eq!(room.start_game("a", &ids(&["a"])), Err(RoomError::NotEnoughPlayers));

        room.start_game("a", &ids(&["a", "b", "c"])).unwrap();
        assert_eq!(room.status, RoomStatus::Active);
        assert_eq!(room.current_round, 1);
        assert_eq!(room.phase, Some(TurnPhase::SelectingWord));
        assert_eq!(room.current_drawer_id.as_deref(), Some("a"));
        assert_eq!(room.drawer_queue, VecDeque::from(ids(&["b", "c"])));

        // no second start while a game runs
        assert_eq!(
            room.start_game("a", &ids(&["a", "b", "c"])),
            Err(RoomError::WrongState)
        );
    }

    #[test]
    fn exactly_one_drawer_while_active() {
        let mut room = room_with_players(&["a", "b"]);
        room.start_game("a", &ids(&["a", "b"])).unwrap();

        let present = ids(&["a", "b"]);
        while room.is_active() {
            assert!(room.current_drawer_id.is_some());
            assert!(!room.drawer_queue.contains(room.current_drawer_id.as_ref().unwrap()));
            room.begin_turn("apple", 1_000).unwrap();
            room.end_turn(TurnEndReason::Timeout, &present).unwrap();
        }
        assert_eq!(room.status, RoomStatus::Finished);
    }

    #[test]
    fn rounds_increment_when_queue_empties() {
        let mut room = room_with_players(&["a", "b"]);
        room.settings.max_rounds = 2;
        room.start_game("a", &ids(&["a", "b"])).unwrap();
        let present = ids(&["a", "b"]);

        // round 1: a then b
        room.begin_turn("one", 0).unwrap();
        let end = room.end_turn(TurnEndReason::Timeout, &present).unwrap();
        assert!(!end.new_round);
        assert_eq!(end.next_drawer_id.as_deref(), Some("b"));

        room.begin_turn("two", 0).unwrap();
        let end = room.end_turn(TurnEndReason::AllGuessed, &present).unwrap();
        assert!(end.new_round);
        assert_eq!(room.current_round, 2);

        // round 2 finishes the game
        room.begin_turn("three", 0).unwrap();
        room.end_turn(TurnEndReason::Timeout, &present).unwrap();
        room.begin_turn("four", 0).unwrap();
        let end = room.end_turn(TurnEndReason::Timeout, &present).unwrap();
        assert!(end.game_over);
        assert_eq!(room.status, RoomStatus::Finished);
        assert_eq!(room.current_round, 3);
    }

    #[test]
    fn drawer_leave_ends_turn_and_advances() {
        let mut room = room_with_players(&["a", "b", "c"]);
        room.start_game("a", &ids(&["a", "b", "c"])).unwrap();
        room.begin_turn("apple", 0).unwrap();

        let outcome = room.remove_player("a", &ids(&["b", "c"]));
        let end = outcome.turn_end.expect("turn should end");
        assert_eq!(end.reason, TurnEndReason::DrawerLeft);
        assert_eq!(end.word.as_deref(), Some("apple"));
        assert!(outcome.admin_vacated);
        assert_eq!(room.current_drawer_id.as_deref(), Some("b"));
        assert_eq!(room.phase, Some(TurnPhase::SelectingWord));
    }

    #[test]
    fn dropping_below_two_players_returns_to_waiting() {
        let mut room = room_with_players(&["a", "b"]);
        room.start_game("a", &ids(&["a", "b"])).unwrap();
        room.begin_turn("apple", 0).unwrap();

        let outcome = room.remove_player("b", &ids(&["a"]));
        assert!(outcome.went_waiting);
        assert_eq!(room.status, RoomStatus::Waiting);
        assert_eq!(room.current_round, 0);
        assert!(room.current_drawer_id.is_none());
    }

    #[test]
    fn leaver_in_queue_never_draws() {
        let mut room = room_with_players(&["a", "b", "c"]);
        room.start_game("a", &ids(&["a", "b", "c"])).unwrap();
        room.begin_turn("apple", 0).unwrap();

        // b leaves while queued
        room.remove_player("b", &ids(&["a", "c"]));
        let end = room.end_turn(TurnEndReason::Timeout, &ids(&["a", "c"])).unwrap();
        assert_eq!(end.next_drawer_id.as_deref(), Some("c"));
    }

    #[test]
    fn late_joiner_is_appended_to_queue() {
        let mut room = room_with_players(&["a", "b"]);
        room.start_game("a", &ids(&["a", "b"])).unwrap();
        room.add_late_joiner("c");
        assert_eq!(room.drawer_queue, VecDeque::from(ids(&["b", "c"])));

        // joining twice does not double-queue
        room.add_late_joiner("c");
        assert_eq!(room.drawer_queue.len(), 2);
    }

    #[test]
    fn settings_locked_while_active() {
        let mut room = room_with_players(&["a", "b"]);
        let patch = SettingsPatch {
            max_rounds: Some(5),
            ..Default::default()
        };

        room.apply_settings("a", &patch).unwrap();
        assert_eq!(room.settings.max_rounds, 5);

        room.start_game("a", &ids(&["a", "b"])).unwrap();
        assert_eq!(room.apply_settings("a", &patch), Err(RoomError::WrongState));
        assert_eq!(
            room.apply_settings("b", &SettingsPatch::default()),
            Err(RoomError::NotAdmin)
        );
    }

    #[test]
    fn settings_values_are_constrained() {
        let room_defaults = RoomSettings::default();
        let bad = RoomSettings {
            max_rounds: 4,
            ..room_defaults.clone()
        };
        assert!(bad.validate().is_err());

        let bad = RoomSettings {
            turn_time_sec: 61,
            ..room_defaults.clone()
        };
        assert!(bad.validate().is_err());

        let bad = RoomSettings {
            max_players: 9,
            ..room_defaults
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn skip_is_single_use() {
        let mut room = room_with_players(&["a", "b"]);
        room.start_game("a", &ids(&["a", "b"])).unwrap();

        assert_eq!(room.use_skip("b"), Err(RoomError::NotDrawer));
        room.use_skip("a").unwrap();
        assert_eq!(room.use_skip("a"), Err(RoomError::SkipExhausted));
    }

    #[test]
    fn mask_hides_letters_but_not_special_chars() {
        let mut room = room_with_players(&["a", "b"]);
        room.start_game("a", &ids(&["a", "b"])).unwrap();
        room.begin_turn("ice-cream van", 0).unwrap();

        assert_eq!(room.masked_word().unwrap(), "___-_____ ___");
        assert_eq!(
            room.special_chars(),
            vec![
                SpecialChar { index: 3, ch: '-' },
                SpecialChar { index: 9, ch: ' ' },
            ]
        );

        let ch = room.reveal_index(0).unwrap();
        assert_eq!(ch, 'i');
        assert_eq!(room.masked_word().unwrap(), "i__-_____ ___");
    }

    #[test]
    fn reveals_stop_at_half_the_letters() {
        let mut room = room_with_players(&["a", "b"]);
        room.start_game("a", &ids(&["a", "b"])).unwrap();
        room.begin_turn("abcd", 0).unwrap();

        assert_eq!(room.reveal_candidates().len(), 4);
        room.reveal_index(1);
        assert_eq!(room.reveal_candidates().len(), 3);
        room.reveal_index(2);
        // two of four letters revealed, no more hints
        assert!(room.reveal_candidates().is_empty());
    }

    #[test]
    fn turn_token_fences_phase_changes() {
        let mut room = room_with_players(&["a", "b"]);
        room.start_game("a", &ids(&["a", "b"])).unwrap();
        let selecting = room.turn_token;

        room.begin_turn("apple", 0).unwrap();
        assert!(room.turn_token > selecting);

        let drawing = room.turn_token;
        room.end_turn(TurnEndReason::Timeout, &ids(&["a", "b"])).unwrap();
        assert!(room.turn_token > drawing);
    }

    #[test]
    fn degraded_room_starts_no_game() {
        let mut room = room_with_players(&["a", "b"]);
        room.degraded = true;
        assert_eq!(
            room.start_game("a", &ids(&["a", "b"])),
            Err(RoomError::WrongState)
        );
        assert_eq!(room.status, RoomStatus::Waiting);
    }

    #[test]
    fn restart_after_finish() {
        let mut room = room_with_players(&["a", "b"]);
        room.settings.max_rounds = 1;
        room.start_game("a", &ids(&["a", "b"])).unwrap();
        let present = ids(&["a", "b"]);

        room.begin_turn("one", 0).unwrap();
        room.end_turn(TurnEndReason::Timeout, &present).unwrap();
        room.begin_turn("two", 0).unwrap();
        let end = room.end_turn(TurnEndReason::Timeout, &present).unwrap();
        assert!(end.game_over);

        room.start_game("a", &present).unwrap();
        assert_eq!(room.status, RoomStatus::Active);
        assert_eq!(room.current_round, 1);
    }
}
