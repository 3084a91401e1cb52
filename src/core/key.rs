//! Purpose: Turn untrusted key input into canonical counter identities.
//! Exports: `CounterKey`, `normalize`, `MAX_KEY_LEN`, `GLOBAL_KEY`.
//! Role: Total, pure boundary function; every input yields a usable identity.
//! Invariants: Canonical keys are non-empty, at most `MAX_KEY_LEN` chars, drawn from
//! `[a-zA-Z0-9._:-]`, with no leading, trailing, or doubled `-`.
//! Invariants: Empty or fully-invalid input maps to `GLOBAL_KEY`.

use std::fmt;

use serde::Serialize;

/// Limit in UTF-16 code units of trimmed input; canonical keys are ASCII, so it
/// also bounds their length in bytes.
pub const MAX_KEY_LEN: usize = 120;
pub const GLOBAL_KEY: &str = "global";

/// A normalized counter identity.
///
/// Only `normalize` and `CounterKey::parse` construct values, so holding a
/// `CounterKey` is proof that the string is canonical.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct CounterKey(String);

impl CounterKey {
    /// Accepts a string only if it is already canonical.
    pub fn parse(value: &str) -> Option<Self> {
        if is_canonical(value) {
            Some(Self(value.to_string()))
        } else {
            None
        }
    }

    pub fn global() -> Self {
        Self(GLOBAL_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for CounterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalizes raw input: trim, truncate, replace disallowed chars with `-`,
/// collapse `-` runs, strip edge dashes, and fall back to `global`.
pub fn normalize(raw: &str) -> CounterKey {
    let trimmed = raw.trim_matches(|ch: char| ch.is_whitespace() || ch == '\u{feff}');

    let mut out = String::with_capacity(trimmed.len().min(MAX_KEY_LEN));
    let mut units = 0;
    for ch in trimmed.chars() {
        if units >= MAX_KEY_LEN {
            break;
        }
        // A surrogate pair cut by the limit still leaves a disallowed half behind.
        units += ch.len_utf16();
        let ch = if is_key_char(ch) { ch } else { '-' };
        if ch == '-' && out.ends_with('-') {
            continue;
        }
        out.push(ch);
    }

    let stripped = out.strip_prefix('-').unwrap_or(&out);
    let stripped = stripped.strip_suffix('-').unwrap_or(stripped);
    if stripped.is_empty() {
        return CounterKey::global();
    }
    CounterKey(stripped.to_string())
}

fn is_key_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-')
}

fn is_canonical(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_KEY_LEN
        && value.chars().all(is_key_char)
        && !value.starts_with('-')
        && !value.ends_with('-')
        && !value.contains("--")
}

#[cfg(test)]
mod tests {
    use super::{CounterKey, GLOBAL_KEY, MAX_KEY_LEN, normalize};

    #[test]
    fn keeps_canonical_keys() {
        assert_eq!(normalize("my-song").as_str(), "my-song");
        assert_eq!(normalize("v1.2:intro_take").as_str(), "v1.2:intro_take");
    }

    #[test]
    fn empty_and_blank_fall_back_to_global() {
        assert_eq!(normalize("").as_str(), GLOBAL_KEY);
        assert_eq!(normalize("   \t\n").as_str(), GLOBAL_KEY);
        assert_eq!(normalize("////").as_str(), GLOBAL_KEY);
        assert_eq!(normalize("🎵🎶").as_str(), GLOBAL_KEY);
    }

    #[test]
    fn replaces_and_collapses_disallowed_runs() {
        assert_eq!(normalize("  Hello, World!  ").as_str(), "Hello-World");
        assert_eq!(normalize("a//b  c").as_str(), "a-b-c");
        assert_eq!(normalize("a---b").as_str(), "a-b");
        assert_eq!(normalize("-lead and trail-").as_str(), "lead-and-trail");
        assert_eq!(normalize("café").as_str(), "caf");
    }

    #[test]
    fn dots_survive_without_segment_context() {
        assert_eq!(normalize("../../etc").as_str(), "..-..-etc");
    }

    #[test]
    fn truncates_before_filtering() {
        let raw = format!("{}{}", "a".repeat(MAX_KEY_LEN), "tail");
        let key = normalize(&raw);
        assert_eq!(key.as_str().len(), MAX_KEY_LEN);
        assert!(!key.as_str().contains("tail"));

        // Truncation leaves a trailing dash, which is then stripped.
        let raw = format!("{}-x", "b".repeat(MAX_KEY_LEN - 1));
        assert_eq!(normalize(&raw).as_str(), "b".repeat(MAX_KEY_LEN - 1));
    }

    #[test]
    fn truncation_counts_utf16_units() {
        // Each note is a surrogate pair, so sixty of them fill the limit.
        let raw = format!("{}abc", "🎵".repeat(60));
        assert_eq!(normalize(&raw).as_str(), GLOBAL_KEY);

        let raw = format!("{}abc", "🎵".repeat(59));
        assert_eq!(normalize(&raw).as_str(), "ab");

        let raw = format!("{}🎵tail", "a".repeat(MAX_KEY_LEN - 1));
        assert_eq!(normalize(&raw).as_str(), "a".repeat(MAX_KEY_LEN - 1));

        let raw = format!("{}x", "é".repeat(MAX_KEY_LEN - 1));
        assert_eq!(normalize(&raw).as_str(), "x");
    }

    #[test]
    fn trim_happens_before_truncation() {
        let raw = format!("{}{}", " ".repeat(10), "k".repeat(MAX_KEY_LEN + 5));
        assert_eq!(normalize(&raw).as_str().len(), MAX_KEY_LEN);
    }

    #[test]
    fn parse_accepts_only_canonical() {
        assert!(CounterKey::parse("ok.key").is_some());
        assert!(CounterKey::parse("").is_none());
        assert!(CounterKey::parse("-x").is_none());
        assert!(CounterKey::parse("x-").is_none());
        assert!(CounterKey::parse("a--b").is_none());
        assert!(CounterKey::parse("a b").is_none());
        assert!(CounterKey::parse(&"z".repeat(MAX_KEY_LEN + 1)).is_none());
    }

    #[test]
    fn normalize_is_idempotent_on_output() {
        for raw in ["x", " a b ", "../../etc", "", "🎵 song 🎵"] {
            let once = normalize(raw);
            assert_eq!(normalize(once.as_str()), once);
            assert_eq!(CounterKey::parse(once.as_str()), Some(once.clone()));
        }
    }
}
