//! Turn clocks. The node that opened a phase runs these tasks; the TTL
//! sentinel in the store is the durable twin that fires on any surviving
//! node if this one dies. Handlers never hold the room lock while waiting,
//! they acquire it on wakeup and re-validate, so a double fire is a no-op.

use std::time::Duration;

use super::room::{EngineError, RoomEngine};

#[derive(Clone, Debug)]
pub struct TimerConfig {
    /// seconds the drawer gets to pick a word
    pub word_pick_secs: u64,
    /// elapsed fractions of the turn at which one letter is revealed
    pub hint_fractions: Vec<f64>,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            word_pick_secs: 10,
            hint_fractions: vec![0.5, 0.75],
        }
    }
}

enum Tick {
    Deadline(Option<u64>),
    Hint(u64),
}

/// Word-pick and turn deadlines share one shape: sleep, then run the
/// idempotent deadline handler fenced by the turn token.
pub(super) fn spawn_deadline_timer(engine: RoomEngine, room_id: String, token: u64, secs: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        run_tick(&engine, &room_id, Tick::Deadline(Some(token))).await;
    });
}

/// Letter reveals at the configured elapsed fractions of the turn.
pub(super) fn spawn_hint_timers(engine: RoomEngine, room_id: String, token: u64, turn_time_secs: u64) {
    let mut fractions = engine.config().timers.hint_fractions.clone();
    fractions.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    tokio::spawn(async move {
        let mut elapsed = 0.0;
        for fraction in fractions {
            let at = turn_time_secs as f64 * fraction.clamp(0.0, 1.0);
            tokio::time::sleep(Duration::from_secs_f64((at - elapsed).max(0.0))).await;
            elapsed = at;
            run_tick(&engine, &room_id, Tick::Hint(token)).await;
        }
    });
}

/// Entry point for the store's expired-key notifications: a deadline
/// sentinel vanished, so the phase it guarded is over on some node's
/// authority, possibly a dead one's.
pub fn spawn_recovered_deadline(engine: RoomEngine, room_id: String) {
    tokio::spawn(async move {
        run_tick(&engine, &room_id, Tick::Deadline(None)).await;
    });
}

/// Run a tick; on an infrastructure error retry once, then degrade the
/// room rather than keep scheduling turns against a dead store.
async fn run_tick(engine: &RoomEngine, room_id: &str, tick: Tick) {
    let first = fire(engine, room_id, &tick).await;

    let err = match first {
        Ok(()) => return,
        Err(EngineError::Store(err)) => err,
        Err(err) => {
            log::debug!("timer tick in {} became a no-op: {}", room_id, err);
            return;
        }
    };

    log::warn!("timer tick in {} failed ({}), retrying once", room_id, err);
    tokio::time::sleep(Duration::from_secs(1)).await;

    match fire(engine, room_id, &tick).await {
        Ok(()) => {}
        Err(EngineError::Store(err)) => {
            log::error!("timer tick in {} failed again: {}", room_id, err);
            engine.mark_degraded(room_id).await;
        }
        Err(err) => log::debug!("timer tick in {} became a no-op: {}", room_id, err),
    }
}

async fn fire(engine: &RoomEngine, room_id: &str, tick: &Tick) -> Result<(), EngineError> {
    match tick {
        Tick::Deadline(token) => engine.deadline_tick(room_id, *token).await,
        Tick::Hint(token) => engine.hint_tick(room_id, *token).await,
    }
}
