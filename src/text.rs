//! Display formatting for recognizer token streams
//!
//! The recognizer returns space-separated tokens with punctuation as separate
//! tokens (`"hi . there"`). [`TextNormalizer::format`] glues them back into
//! readable text and capitalizes sentence starts.

const WHITESPACE: [char; 3] = [' ', '\n', '\t'];
const PUNCTUATION: [char; 8] = [',', ':', ';', '.', '!', '?', '-', ')'];
const END_OF_SENTENCE: [char; 4] = ['.', '!', '?', ')'];

/// Stateless single-pass token formatter
pub struct TextNormalizer;

impl TextNormalizer {
    /// Format a raw token stream for display
    ///
    /// Rules, applied per non-empty token:
    /// - no glue space before a token when the previous token started with
    ///   whitespace, or when this token starts with whitespace or punctuation
    /// - capitalize the first character while at sentence start
    /// - sentence start is set by a one-character `. ! ? )` token, cleared by
    ///   any longer token or any token not preceded by whitespace
    ///
    /// The text starts at sentence start.
    pub fn format(raw: &str) -> String {
        let mut text = String::with_capacity(raw.len());
        let mut sentence_start = true;
        let mut whitespace_before = false;

        for tok in raw.split(' ') {
            let Some(first) = tok.chars().next() else {
                continue;
            };

            let glue = !(whitespace_before
                || WHITESPACE.contains(&first)
                || PUNCTUATION.contains(&first));

            if !text.is_empty() && glue {
                text.push(' ');
            }

            if sentence_start {
                text.extend(first.to_uppercase());
                text.push_str(&tok[first.len_utf8()..]);
            } else {
                text.push_str(tok);
            }

            whitespace_before = WHITESPACE.contains(&first);

            if tok.chars().count() > 1 {
                sentence_start = false;
            } else if END_OF_SENTENCE.contains(&first) {
                sentence_start = true;
            } else if !whitespace_before {
                sentence_start = false;
            }
        }

        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capitalizes_first_word() {
        assert_eq!(TextNormalizer::format("hello world"), "Hello world");
    }

    #[test]
    fn test_sentence_start_after_period() {
        assert_eq!(TextNormalizer::format("hi . there"), "Hi. There");
    }

    #[test]
    fn test_punctuation_glued_without_space() {
        assert_eq!(
            TextNormalizer::format("one , two ; three !"),
            "One, two; three!"
        );
    }

    #[test]
    fn test_empty_tokens_dropped() {
        assert_eq!(TextNormalizer::format("  a   b  "), "A b");
        assert_eq!(TextNormalizer::format(""), "");
        assert_eq!(TextNormalizer::format("   "), "");
    }

    #[test]
    fn test_multi_char_punctuation_does_not_start_sentence() {
        // "..." is longer than one character
        assert_eq!(TextNormalizer::format("wait ... what"), "Wait... what");
    }

    #[test]
    fn test_closing_paren_ends_sentence() {
        assert_eq!(TextNormalizer::format("yes ) no"), "Yes) No");
    }

    #[test]
    fn test_newline_token_suppresses_next_glue() {
        // "\n" is a one-character whitespace token: it keeps sentence start
        // and the following token is glued without a space.
        assert_eq!(TextNormalizer::format("end . \n next"), "End.\nNext");
    }

    #[test]
    fn test_single_letter_word_clears_sentence_start() {
        assert_eq!(TextNormalizer::format("a b c"), "A b c");
    }

    #[test]
    fn test_non_ascii_capitalization() {
        assert_eq!(TextNormalizer::format("ābols . šis"), "Ābols. Šis");
    }
}
