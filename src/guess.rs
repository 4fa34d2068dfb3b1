//! Decides what a chat line means while a turn is running: the word itself,
//! nearly the word, or plain chat.

#[derive(Clone, Debug)]
pub struct GuessConfig {
    /// similarity at or above which an equal-length guess counts as close
    pub close_threshold: f64,
}

impl Default for GuessConfig {
    fn default() -> Self { Self { close_threshold: 0.75 } }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuessOutcome {
    Correct,
    Close,
    Miss,
}

/// Evaluate a guesser's message against the current word. The word is stored
/// lowercased; the guess is normalized the same way before comparing.
pub fn evaluate(word: &str, guess: &str, config: &GuessConfig) -> GuessOutcome {
    let word = word.trim().to_lowercase();
    let guess = guess.trim().to_lowercase();

    if guess == word {
        return GuessOutcome::Correct;
    }

    if is_close(&word, &guess, config) {
        return GuessOutcome::Close;
    }

    GuessOutcome::Miss
}

fn is_close(word: &str, guess: &str, config: &GuessConfig) -> bool {
    let word_len = word.chars().count();
    let guess_len = guess.chars().count();

    if word_len == 0 || guess_len == 0 {
        return false;
    }

    // a longer message that contains the whole word gives it away
    if guess_len > word_len && guess.contains(word) {
        return true;
    }

    if guess_len == word_len {
        let distance = levenshtein_distance(guess, word);
        let similarity = 1.0 - distance as f64 / word_len as f64;
        return similarity >= config.close_threshold;
    }

    false
}

/// Whether a drawer's chat line would leak the word: it contains the word or
/// any token of it is a close variant. Such messages are dropped silently.
pub fn drawer_leaks_word(word: &str, message: &str, config: &GuessConfig) -> bool {
    let word = word.trim().to_lowercase();
    let message = message.trim().to_lowercase();

    if message.contains(&word) {
        return true;
    }

    message
        .split_whitespace()
        .any(|token| is_close(&word, token, config) || token == word)
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let w1 = a.chars().collect::<Vec<_>>();
    let w2 = b.chars().collect::<Vec<_>>();

    let a_len = w1.len() + 1;
    let b_len = w2.len() + 1;

    let mut matrix = vec![vec![0]];

    for i in 1..a_len {
        matrix[0].push(i);
    }
    for j in 1..b_len {
        matrix.push(vec![j]);
    }

    for (j, i) in (1..b_len).flat_map(|j| (1..a_len).map(move |i| (j, i))) {
        let x: usize = if w1[i - 1].eq_ignore_ascii_case(&w2[j - 1]) {
            matrix[j - 1][i - 1]
        } else {
            1 + std::cmp::min(
                std::cmp::min(matrix[j][i - 1], matrix[j - 1][i]),
                matrix[j - 1][i - 1],
            )
        };
        matrix[j].push(x);
    }
    matrix[b_len - 1][a_len - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(word: &str, guess: &str) -> GuessOutcome {
        evaluate(word, guess, &GuessConfig::default())
    }

    #[test]
    fn exact_match_ignores_case_and_whitespace() {
        assert_eq!(eval("apple", "apple"), GuessOutcome::Correct);
        assert_eq!(eval("apple", "  Apple "), GuessOutcome::Correct);
        assert_eq!(eval("ice-cream", "Ice-Cream"), GuessOutcome::Correct);
    }

    #[test]
    fn single_typo_on_equal_length_is_close() {
        assert_eq!(eval("apple", "apple"), GuessOutcome::Correct);
        assert_eq!(eval("apple", "appla"), GuessOutcome::Close);
        assert_eq!(eval("banana", "banane"), GuessOutcome::Close);
    }

    #[test]
    fn containment_in_a_longer_guess_is_close() {
        assert_eq!(eval("apple", "is it an apple?"), GuessOutcome::Close);
        assert_eq!(eval("car", "racecar"), GuessOutcome::Close);
    }

    #[test]
    fn distant_words_are_misses() {
        assert_eq!(eval("apple", "maple"), GuessOutcome::Miss);
        assert_eq!(eval("apple", "pear"), GuessOutcome::Miss);
        assert_eq!(eval("cat", "cot"), GuessOutcome::Miss); // 0.67 < 0.75
    }

    #[test]
    fn threshold_is_configurable() {
        let lax = GuessConfig { close_threshold: 0.6 };
        assert_eq!(evaluate("cat", "cot", &lax), GuessOutcome::Close);
    }

    #[test]
    fn drawer_chat_is_filtered() {
        let config = GuessConfig::default();
        assert!(drawer_leaks_word("apple", "the apple is red", &config));
        assert!(drawer_leaks_word("apple", "APPLE", &config));
        assert!(drawer_leaks_word("apple", "try appla maybe", &config));
        assert!(!drawer_leaks_word("apple", "keep guessing!", &config));
    }
}
