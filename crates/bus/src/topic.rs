// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! AMQP topic-pattern matching: `*` matches exactly one dot-separated word,
//! `#` matches zero or more words.

pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pat, &key)
}

fn matches_words(pat: &[&str], key: &[&str]) -> bool {
    match pat.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // `#` absorbs any number of words, including none.
            (0..=key.len()).any(|skip| matches_words(rest, &key[skip..]))
        }
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => matches_words(rest, key_rest),
            None => false,
        },
        Some((word, rest)) => match key.split_first() {
            Some((key_word, key_rest)) => word == key_word && matches_words(rest, key_rest),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::matches;

    #[test]
    fn single_word_wildcards() {
        assert!(matches("test.*", "test.key"));
        assert!(matches("test.#", "test.key"));
        assert!(matches("#", "test.key"));
        assert!(!matches("other.*", "test.key"));
    }

    #[test]
    fn star_is_exactly_one_word() {
        assert!(!matches("test.*", "test"));
        assert!(!matches("test.*", "test.key.deep"));
        assert!(matches("command.host.*.session.*", "command.host.42.session.start"));
        assert!(!matches("command.host.*.session.*", "command.host.42.session"));
    }

    #[test]
    fn hash_absorbs_zero_or_more() {
        assert!(matches("test.#", "test"));
        assert!(matches("test.#", "test.key.deep.deeper"));
        assert!(matches("status.session.#", "status.session.12.running"));
        assert!(matches("#.crashed", "status.session.12.crashed"));
        assert!(!matches("status.session.#", "health.host.1"));
    }

    #[test]
    fn exact_match() {
        assert!(matches("health.host.3", "health.host.3"));
        assert!(!matches("health.host.3", "health.host.4"));
    }
}
