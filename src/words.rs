//! Difficulty-tiered word lists and the three-word suggestion draw.

use std::collections::HashSet;

use rand::seq::SliceRandom;

use crate::world::Difficulty;

/// How many candidate words a drawer is offered.
pub const SUGGESTION_COUNT: usize = 3;

pub struct WordCatalog {
    easy: Vec<String>,
    medium: Vec<String>,
    hard: Vec<String>,
}

/// Outcome of one suggestion draw.
pub struct Suggestion {
    pub words: Vec<String>,
    /// true when the unused pool ran dry and was reset for this draw
    pub pool_reset: bool,
}

impl WordCatalog {
    /// The dictionaries compiled into the binary.
    pub fn embedded() -> Self {
        Self {
            easy: parse_word_list(include_str!("assets/words_easy.txt")),
            medium: parse_word_list(include_str!("assets/words_medium.txt")),
            hard: parse_word_list(include_str!("assets/words_hard.txt")),
        }
    }

    pub fn tier(&self, difficulty: Difficulty) -> &[String] {
        match difficulty {
            Difficulty::Easy => &self.easy,
            Difficulty::Medium => &self.medium,
            Difficulty::Hard => &self.hard,
        }
    }

    /// Draw three random words not yet used this round. When fewer than
    /// three unused words remain the pool starts over.
    pub fn suggest(&self, difficulty: Difficulty, used: &HashSet<String>) -> Suggestion {
        let tier = self.tier(difficulty);

        let mut available: Vec<&String> = tier.iter().filter(|w| !used.contains(*w)).collect();
        let mut pool_reset = false;

        if available.len() < SUGGESTION_COUNT {
            log::info!(
                "word pool for {:?} exhausted ({} words left), resetting",
                difficulty,
                available.len()
            );
            available = tier.iter().collect();
            pool_reset = true;
        }

        let mut rng = rand::thread_rng();
        let words = available
            .choose_multiple(&mut rng, SUGGESTION_COUNT)
            .map(|w| (*w).clone())
            .collect();

        Suggestion { words, pool_reset }
    }
}

fn parse_word_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tier_has_a_real_dictionary() {
        let catalog = WordCatalog::embedded();
        for difficulty in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            let tier = catalog.tier(difficulty);
            assert!(tier.len() >= 50, "{:?} tier too small", difficulty);
            assert!(tier.iter().all(|w| *w == w.to_lowercase()));
        }
    }

    #[test]
    fn suggestions_avoid_used_words() {
        let catalog = WordCatalog::embedded();
        let mut used = HashSet::new();

        for _ in 0..10 {
            let suggestion = catalog.suggest(Difficulty::Easy, &used);
            assert_eq!(suggestion.words.len(), SUGGESTION_COUNT);
            assert!(!suggestion.pool_reset);
            for word in &suggestion.words {
                assert!(!used.contains(word), "{} suggested twice", word);
                used.insert(word.clone());
            }
        }
    }

    #[test]
    fn exhausted_pool_resets() {
        let catalog = WordCatalog::embedded();
        let tier = catalog.tier(Difficulty::Easy);

        // leave fewer than three unused
        let used: HashSet<String> = tier.iter().skip(2).cloned().collect();
        let suggestion = catalog.suggest(Difficulty::Easy, &used);
        assert!(suggestion.pool_reset);
        assert_eq!(suggestion.words.len(), SUGGESTION_COUNT);
    }

    #[test]
    fn suggestions_are_distinct() {
        let catalog = WordCatalog::embedded();
        for _ in 0..20 {
            let suggestion = catalog.suggest(Difficulty::Hard, &HashSet::new());
            let unique: HashSet<_> = suggestion.words.iter().collect();
            assert_eq!(unique.len(), SUGGESTION_COUNT);
        }
    }
}
