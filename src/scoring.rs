//! Time-weighted points for guessers, a share of them for the drawer.

#[derive(Clone, Debug)]
pub struct ScoreConfig {
    /// points for a correct guess at full time remaining
    pub round_base: u32,
    /// flat bonus every correct guess earns regardless of timing
    pub floor_bonus: u32,
    /// fraction of each guesser's points credited to the drawer
    pub drawer_share: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            round_base: 200,
            floor_bonus: 50,
            drawer_share: 0.5,
        }
    }
}

/// Points for the first correct guess of a non-drawer this turn:
/// `ceil(round_base * time_left / turn_time) + floor_bonus`.
pub fn guesser_points(config: &ScoreConfig, time_left_sec: u64, turn_time_sec: u64) -> u32 {
    if turn_time_sec == 0 {
        return config.floor_bonus;
    }

    let time_left = time_left_sec.min(turn_time_sec);
    let base = u64::from(config.round_base);
    let weighted = (base * time_left).div_ceil(turn_time_sec) as u32;

    weighted + config.floor_bonus
}

/// The drawer's cumulative bonus per correct guess:
/// `floor(drawer_share * guesser_points)`.
pub fn drawer_bonus(config: &ScoreConfig, guesser_points: u32) -> u32 {
    (config.drawer_share * f64::from(guesser_points)).floor() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_at_ten_seconds_into_a_minute() {
        // ceil(200 * 50 / 60) + 50 = 167 + 50
        let config = ScoreConfig::default();
        let points = guesser_points(&config, 50, 60);
        assert_eq!(points, 217);
        assert_eq!(drawer_bonus(&config, points), 108);
    }

    #[test]
    fn full_and_zero_time_bounds() {
        let config = ScoreConfig::default();
        assert_eq!(guesser_points(&config, 60, 60), 250);
        assert_eq!(guesser_points(&config, 0, 60), 50);
        // clock skew past the deadline never exceeds the full-time award
        assert_eq!(guesser_points(&config, 90, 60), 250);
    }

    #[test]
    fn later_guesses_never_outscore_earlier_ones() {
        let config = ScoreConfig::default();
        let mut last = u32::MAX;
        for left in (0..=120).rev() {
            let points = guesser_points(&config, left, 120);
            assert!(points <= last);
            last = points;
        }
    }

    #[test]
    fn drawer_share_floors() {
        let config = ScoreConfig::default();
        assert_eq!(drawer_bonus(&config, 217), 108);
        assert_eq!(drawer_bonus(&config, 250), 125);
        assert_eq!(drawer_bonus(&config, 0), 0);
    }
}
