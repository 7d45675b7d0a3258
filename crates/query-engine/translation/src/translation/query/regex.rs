//! Literalization of `$regex` patterns before they reach the database.
//!
//! `\Q...\E` quoted sections are escaped character by character so the
//! quoted text can never be interpreted as regex metacharacters or break
//! out of a string literal. Leading `^` and trailing `$` anchors are
//! preserved.

/// Escape one literal section: alphanumerics pass through, single
/// quotes are doubled, everything else is backslash-escaped.
fn create_literal_regex(remaining: &str) -> String {
    let mut out = String::with_capacity(remaining.len());
    for c in remaining.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if c == '\'' {
            out.push_str("''");
        } else {
            out.push('\\');
            out.push(c);
        }
    }
    out
}

/// Literalize `\Q...\E` sections of a pattern. An unterminated `\Q`
/// quotes the rest of the pattern.
pub fn literalize_regex_part(pattern: &str) -> String {
    if let Some(start) = pattern.find("\\Q") {
        let prefix = &pattern[..start];
        let rest = &pattern[start + 2..];
        let (quoted, remainder) = match rest.find("\\E") {
            Some(end) => (&rest[..end], &rest[end + 2..]),
            None => (rest, ""),
        };
        let mut out = String::new();
        out.push_str(&prefix.replace('\'', "''"));
        out.push_str(&create_literal_regex(quoted));
        out.push_str(&literalize_regex_part(remainder));
        out
    } else {
        pattern.replace('\'', "''")
    }
}

/// Process a client-supplied regex pattern: detect and preserve anchors,
/// literalize quoted sections.
pub fn process_regex_pattern(pattern: &str) -> String {
    if let Some(rest) = pattern.strip_prefix('^') {
        // regex for startsWith
        return format!("^{}", literalize_regex_part(rest));
    }
    if let Some(rest) = pattern.strip_suffix('$') {
        // regex for endsWith
        return format!("{}$", literalize_regex_part(rest));
    }
    literalize_regex_part(pattern)
}

/// `x` option: "extended" mode strips unescaped whitespace and `#`
/// comments from the pattern before matching.
pub fn remove_white_space(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut in_comment = false;
    while let Some(c) = chars.next() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        match c {
            '\\' => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '#' => in_comment = true,
            c if c.is_whitespace() => {}
            c => out.push(c),
        }
    }
    out
}

/// Whether a `$all` element is a starts-with regex wrapper:
/// `{"$regex": "^\\Q...\\E"}`.
pub fn is_starts_with_regex(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .and_then(|obj| obj.get("$regex"))
        .and_then(|pattern| pattern.as_str())
        .is_some_and(|pattern| pattern.starts_with("^\\Q") && pattern.ends_with("\\E"))
}

/// Whether a value is any `{"$regex": ...}` wrapper.
pub fn is_any_regex(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.contains_key("$regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_sections_are_escaped_character_by_character() {
        // must match the literal "a.b" at start of input, not "aXb"
        let processed = process_regex_pattern("^\\Qa.b\\E");
        assert_eq!(processed, "^a\\.b");
    }

    #[test]
    fn anchors_are_preserved() {
        assert_eq!(process_regex_pattern("^\\Qfoo\\E"), "^foo");
        assert_eq!(process_regex_pattern("\\Qfoo\\E$"), "foo$");
    }

    #[test]
    fn unterminated_quote_runs_to_end() {
        assert_eq!(process_regex_pattern("\\Qa+b"), "a\\+b");
    }

    #[test]
    fn single_quotes_are_doubled() {
        assert_eq!(process_regex_pattern("\\Qit's\\E"), "it''s");
        // outside quoted sections too, so the literal cannot close a
        // string it ends up embedded in
        assert_eq!(process_regex_pattern("it's"), "it''s");
    }

    #[test]
    fn extended_mode_strips_whitespace_and_comments() {
        assert_eq!(remove_white_space("a b\tc"), "abc");
        assert_eq!(remove_white_space("ab # a comment\ncd"), "abcd");
        // escaped whitespace survives
        assert_eq!(remove_white_space("a\\ b"), "a\\ b");
    }

    #[test]
    fn starts_with_detection() {
        assert!(is_starts_with_regex(
            &serde_json::json!({"$regex": "^\\Qfoo\\E"})
        ));
        assert!(!is_starts_with_regex(&serde_json::json!({"$regex": "foo"})));
        assert!(!is_starts_with_regex(&serde_json::json!("foo")));
    }
}
