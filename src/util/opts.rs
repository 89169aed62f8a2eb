//! Option-string parsing for module arguments
//!
//! Modules receive their arguments as a flat `-key value -key value` string,
//! both from the CLI and from the periodic scheduler's nested `args` option.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Parsed option map
pub type OptMap = HashMap<String, String>;

/// Parse a `-key value -key value ...` string into a map.
///
/// An empty string parses to an empty map. A key without a value, or a value
/// without a preceding `-key`, is a parse error.
pub fn parse_opt_string(opts: &str) -> Result<OptMap> {
    let mut map = HashMap::new();
    let mut tokens = opts.split_whitespace();

    while let Some(tok) = tokens.next() {
        let key = tok
            .strip_prefix('-')
            .ok_or_else(|| Error::parse(format!("expected -key, got: {}", tok)))?;
        let val = tokens
            .next()
            .ok_or_else(|| Error::parse(format!("option -{} has no value", key)))?;
        map.insert(key.to_string(), val.to_string());
    }

    Ok(map)
}

/// True if every one of `keys` is present in the map
pub fn check_for_keys(map: &OptMap, keys: &[&str]) -> bool {
    keys.iter().all(|k| map.contains_key(*k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opt_string() {
        let map = parse_opt_string("-entity acme -start 2013-01-01 -end 2013-01-02").unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("entity").map(String::as_str), Some("acme"));
        assert_eq!(map.get("start").map(String::as_str), Some("2013-01-01"));
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_opt_string("").unwrap().is_empty());
        assert!(parse_opt_string("   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_opt_string("entity acme").is_err());
        assert!(parse_opt_string("-entity").is_err());
    }

    #[test]
    fn test_check_for_keys() {
        let map = parse_opt_string("-duration 10s -module hijack -args -a_b_c").unwrap();
        assert!(check_for_keys(&map, &["duration", "module"]));
        assert!(!check_for_keys(&map, &["duration", "missing"]));
    }
}
