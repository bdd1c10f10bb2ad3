//! `{name}` placeholder tokens.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::DjaqResult;

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("placeholder pattern"))
}

/// Every placeholder name in `text`, quoted or not, in order of appearance.
pub fn names(text: &str) -> Vec<&str> {
    pattern()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect()
}

/// Replace placeholders that sit outside single-quoted SQL strings.
///
/// `replace` receives the placeholder name and returns its substitution.
pub fn rewrite<F>(sql: &str, mut replace: F) -> DjaqResult<String>
where
    F: FnMut(&str) -> DjaqResult<String>,
{
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    let mut rest = sql;

    while let Some(c) = rest.chars().next() {
        if c == '\'' {
            in_string = !in_string;
        } else if c == '{' && !in_string {
            if let Some(m) = pattern().find(rest).filter(|m| m.start() == 0) {
                out.push_str(&replace(&rest[1..m.end() - 1])?);
                rest = &rest[m.end()..];
                continue;
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(names("x == '{v}' and y > {low}"), vec!["v", "low"]);
        assert!(names("x == 1").is_empty());
    }

    #[test]
    fn test_rewrite_skips_string_literals() {
        let mut n = 0;
        let out = rewrite("a = {x} AND b = '{not_me}' AND c IN {y}", |name| {
            n += 1;
            Ok(format!("${}:{}", n, name))
        })
        .unwrap();
        assert_eq!(out, "a = $1:x AND b = '{not_me}' AND c IN $2:y");
    }

    #[test]
    fn test_rewrite_handles_escaped_quotes() {
        let out = rewrite("a = 'it''s {x}' AND b = {y}", |name| Ok(name.to_uppercase())).unwrap();
        assert_eq!(out, "a = 'it''s {x}' AND b = Y");
    }
}
