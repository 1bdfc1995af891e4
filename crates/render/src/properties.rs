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

//! Java-style `.properties` parsing and rendering.
//!
//! Parse rules: the separator is the first `=` or `:` in the trimmed line;
//! lines starting with `#` or `!` and blank lines are skipped. Rendering
//! emits `key=value` sorted by key, exactly one line per key: cascaded
//! inputs setting the same key collapse to the last writer.

use std::collections::BTreeMap;

pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let separator = line.find(['=', ':']);
        match separator {
            Some(idx) => {
                let key = line[..idx].trim().to_string();
                let value = line[idx + 1..].trim().to_string();
                if !key.is_empty() {
                    map.insert(key, value);
                }
            }
            // A bare word is a key with an empty value.
            None => {
                map.insert(line.to_string(), String::new());
            }
        }
    }
    map
}

/// Fold `overrides` into `base`; overrides win on shared keys.
pub fn merge_properties(
    base: BTreeMap<String, String>,
    overrides: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base;
    merged.extend(overrides);
    merged
}

pub fn render_properties(map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in map {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_both_separators_and_skips_comments() {
        let parsed = parse_properties(
            "# a comment\n! another\n\nmotd=Hello\nmax-players: 20\n  difficulty = normal  \n",
        );
        assert_eq!(
            parsed,
            map(&[
                ("motd", "Hello"),
                ("max-players", "20"),
                ("difficulty", "normal"),
            ])
        );
    }

    #[test]
    fn first_separator_wins() {
        let parsed = parse_properties("url=jdbc:postgres://db/1\n");
        assert_eq!(parsed, map(&[("url", "jdbc:postgres://db/1")]));
    }

    #[test]
    fn merge_preserves_unchanged_keys() {
        // Existing file merged with a session patch.
        let existing = parse_properties("motd=Default\nmax-players=20\ndifficulty=normal\npvp=true");
        let patch = parse_properties("motd=Patched\nmax-players=50");
        let merged = merge_properties(existing, patch);
        assert_eq!(
            merged,
            map(&[
                ("motd", "Patched"),
                ("max-players", "50"),
                ("difficulty", "normal"),
                ("pvp", "true"),
            ])
        );
    }

    #[test]
    fn cascade_dedupes_to_last_writer() {
        // game_config patch then sgc patch, concatenated in cascade order.
        let concatenated = "motd=GC\nmax-players=20\nmotd=SGC-OVERRIDE\n";
        let merged = parse_properties(concatenated);
        assert_eq!(merged, map(&[("motd", "SGC-OVERRIDE"), ("max-players", "20")]));

        let rendered = render_properties(&merged);
        assert_eq!(rendered.matches("motd=").count(), 1);
        assert_eq!(rendered, "max-players=20\nmotd=SGC-OVERRIDE\n");
    }

    #[test]
    fn render_parse_round_trip() {
        let original = map(&[
            ("difficulty", "hard"),
            ("level-name", "world"),
            ("motd", "A Minecraft Server"),
            ("pvp", "false"),
        ]);
        assert_eq!(parse_properties(&render_properties(&original)), original);
    }

    #[test]
    fn rendered_output_is_sorted_one_line_per_key() {
        let rendered = render_properties(&map(&[("b", "2"), ("a", "1"), ("c", "3")]));
        assert_eq!(rendered, "a=1\nb=2\nc=3\n");
    }
}
