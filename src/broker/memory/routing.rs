//! Exchange routing rules.

use crate::broker::{FieldMap, HeaderValue};

/// Topic pattern match: words are `.`-separated, `*` matches exactly one word,
/// `#` matches zero or more.
pub(super) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Headers exchange match. `x-match` selects `all` (default) or `any`;
/// binding keys starting with `x-` take no part in matching.
pub(super) fn headers_match(arguments: &FieldMap, headers: &FieldMap) -> bool {
    let any = arguments
        .get("x-match")
        .and_then(HeaderValue::as_str)
        .map(|m| m.eq_ignore_ascii_case("any"))
        .unwrap_or(false);

    let mut criteria = arguments.iter().filter(|(k, _)| !k.starts_with("x-"));
    let hit = |(k, v): (&String, &HeaderValue)| headers.get(k).is_some_and(|h| h.matches(v));

    if any {
        criteria.any(hit)
    } else {
        criteria.all(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), HeaderValue::from(*v)))
            .collect()
    }

    #[test]
    fn test_topic_exact_and_wildcards() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(!topic_matches("orders.created", "orders.updated"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "orders.created"));
        assert!(!topic_matches("*", ""));
    }

    #[test]
    fn test_headers_all() {
        let args = table(&[("x-match", "all"), ("a", "1"), ("b", "2")]);
        assert!(headers_match(&args, &table(&[("a", "1"), ("b", "2"), ("c", "3")])));
        assert!(!headers_match(&args, &table(&[("a", "1")])));
        assert!(!headers_match(&args, &table(&[("a", "1"), ("b", "9")])));
    }

    #[test]
    fn test_headers_any() {
        let args = table(&[("x-match", "any"), ("a", "1"), ("b", "2")]);
        assert!(headers_match(&args, &table(&[("b", "2")])));
        assert!(!headers_match(&args, &table(&[("c", "3")])));
    }

    #[test]
    fn test_headers_ignore_x_keys() {
        let args = table(&[("x-match", "all"), ("x-custom", "zzz")]);
        assert!(headers_match(&args, &FieldMap::new()));
    }

    #[test]
    fn test_headers_bytes_match_strings() {
        let args = table(&[("a", "1")]);
        let mut headers = FieldMap::new();
        headers.insert("a".into(), HeaderValue::Bytes(b"1".to_vec()));
        assert!(headers_match(&args, &headers));
    }
}
