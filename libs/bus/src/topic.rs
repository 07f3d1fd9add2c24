//! AMQP topic matching.
//!
//! Keys and patterns are dot-separated words. In a pattern `*` matches exactly
//! one word and `#` matches zero or more words.

/// Returns true if `key` matches the topic `pattern`.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Try every split point, including consuming nothing.
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_segments(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("status.host.#", "status.host.5", true)]
    #[case("status.host.#", "status.host.5.extra", true)]
    #[case("status.host.#", "status.host", true)]
    #[case("status.host.#", "status.session.5", false)]
    #[case("health.*", "health.42", true)]
    #[case("health.*", "health.42.detail", false)]
    #[case("health.*", "health", false)]
    #[case("health.#", "health.host.7", true)]
    #[case("#", "anything.at.all", true)]
    #[case("#", "", true)]
    #[case("*.host.*", "status.host.5", true)]
    #[case("*.host.*", "status.session.5", false)]
    #[case("cmd.host.5.#", "cmd.host.5.session.start", true)]
    #[case("cmd.host.5.#", "cmd.host.51.session.start", false)]
    #[case("a.#.z", "a.z", true)]
    #[case("a.#.z", "a.b.c.z", true)]
    #[case("a.#.z", "a.b.c", false)]
    #[case("#.#", "a", true)]
    #[case("status.host.5", "status.host.5", true)]
    #[case("status.host.5", "status.host.6", false)]
    fn test_topic_table(#[case] pattern: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(matches(pattern, key), expected, "{pattern} vs {key}");
    }

    fn word() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,6}"
    }

    proptest! {
        #[test]
        fn prop_literal_pattern_matches_itself(words in proptest::collection::vec(word(), 1..6)) {
            let key = words.join(".");
            prop_assert!(matches(&key, &key));
        }

        #[test]
        fn prop_hash_suffix_matches_any_extension(
            prefix in proptest::collection::vec(word(), 1..4),
            suffix in proptest::collection::vec(word(), 0..4),
        ) {
            let pattern = format!("{}.#", prefix.join("."));
            let mut key_words = prefix.clone();
            key_words.extend(suffix);
            prop_assert!(matches(&pattern, &key_words.join(".")));
        }

        #[test]
        fn prop_star_requires_exactly_one_word(words in proptest::collection::vec(word(), 0..5)) {
            let key = if words.is_empty() { "root".to_string() } else { format!("root.{}", words.join(".")) };
            prop_assert_eq!(matches("root.*", &key), words.len() == 1);
        }
    }
}
