/// Helpers for abbreviating long strings (URLs, SPARQL queries) before they
/// hit the log. Everything here is best-effort and lossy on purpose.
const DEFAULT_MAX_LENGTH: usize = 80;

/// Collapse every run of whitespace into a single space.
pub fn compact_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Quote and whitespace-collapse a string, then middle-ellipsize it to
/// roughly `DEFAULT_MAX_LENGTH` characters.
pub fn abbrev(long_string: &str) -> String {
    ellipsize(&format!("\"{}\"", compact_ws(long_string)), DEFAULT_MAX_LENGTH)
}

/// Like [`abbrev`], but URL-decode the string first so that encoded queries
/// become readable in the log.
pub fn abbrev_unquoted(long_string: &str) -> String {
    let plus_decoded = long_string.replace('+', " ");
    let decoded = match urlencoding::decode(&plus_decoded) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => plus_decoded,
    };
    let quoted = format!("\"{}\" [unquoted]", compact_ws(&decoded));
    ellipsize(&quoted, DEFAULT_MAX_LENGTH)
}

fn ellipsize(s: &str, max_length: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_length {
        return s.to_string();
    }
    let k = max_length / 2 - 2;
    let head: String = chars[..k].iter().collect();
    let tail: String = chars[chars.len() - k..].iter().collect();
    format!("{head} ... {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_strings_pass_through() {
        assert_eq!(abbrev("hello  world"), "\"hello world\"");
    }

    #[test]
    fn test_long_strings_get_middle_ellipsis() {
        let long = "x".repeat(200);
        let abbreviated = abbrev(&long);
        assert!(abbreviated.len() < 90);
        assert!(abbreviated.contains(" ... "));
    }

    #[test]
    fn test_unquote_decodes_percent_and_plus() {
        let abbreviated = abbrev_unquoted("SELECT+%3Fx%20WHERE");
        assert!(abbreviated.starts_with("\"SELECT ?x WHERE\""));
        assert!(abbreviated.ends_with("[unquoted]"));
    }
}
