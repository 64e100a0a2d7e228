use regex::Regex;
use shared::text::compact_ws;
use std::sync::LazyLock;

/// The tolerant, non-validating query splitter. Anything that does not look
/// like `<prefixes> SELECT <vars> WHERE { <body> } <tail>` after whitespace
/// normalisation is rejected as a whole.
static QUERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(.*?)\s*SELECT\s+(\S[^{]*\S)\s*WHERE\s*\{\s*(\S.*\S)\s*\}\s*(.*?)\s*$")
        .expect("static regex")
});

/// Rewrites an aggregate selection `( expr ( inner ) AS ?v )` to plain `?v`.
static AGGREGATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*[^(]+\s*\([^)]+\)\s*[aA][sS]\s*(\?[^)]+)\s*\)").expect("static regex")
});

static OPEN_PAREN_WS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s+").expect("static regex"));
static WS_CLOSE_PAREN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+\)").expect("static regex"));

static PREFIX_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+PREFIX").expect("static regex"));

/// A SPARQL query split into the parts the name service manipulates. Built
/// once per inbound query and discarded after the enhanced query has been
/// assembled.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedQuery {
    /// Ordered `PREFIX` declarations, one per entry.
    pub prefixes: Vec<String>,
    /// The SELECT clause verbatim (parentheses tightened), including
    /// aggregate expressions.
    pub select_vars_string: String,
    /// Projected variable names; `(... AS ?v)` contributes `?v`.
    pub select_vars: Vec<String>,
    /// The WHERE body, whitespace-collapsed, without a trailing dot.
    pub body: String,
    /// `GROUP BY` clause including a trailing space, or empty.
    pub group_by: String,
    /// Whatever follows (ORDER BY / LIMIT / OFFSET).
    pub footer: String,
}

impl ParsedQuery {
    /// Split a query into its parts. Returns `None` (and logs the query)
    /// when the splitter regex does not match; syntactic correctness of the
    /// query is not checked beyond that.
    pub fn parse(sparql_query: &str) -> Option<ParsedQuery> {
        let collapsed = compact_ws(sparql_query);
        let Some(groups) = QUERY_RE.captures(&collapsed) else {
            tracing::error!(
                "Problem parsing SPARQL query\n{}",
                sparql_query.trim_end()
            );
            tracing::error!("Parse regex does not match");
            return None;
        };

        let prefixes = split_before_prefix(&groups[1]);

        let select_vars_string = OPEN_PAREN_WS_RE.replace_all(&groups[2], "(");
        let select_vars_string = WS_CLOSE_PAREN_RE
            .replace_all(&select_vars_string, ")")
            .into_owned();
        let select_vars = AGGREGATE_RE
            .replace_all(&select_vars_string, "${1}")
            .split_whitespace()
            .map(String::from)
            .collect();

        let mut body = groups[3].trim().to_string();
        if let Some(stripped) = body.strip_suffix('.') {
            body = stripped.trim_end().to_string();
        }

        // Separate a leading GROUP BY (with its ?-variables) from the rest
        // of the tail.
        let footer_parts: Vec<&str> = groups[4].split_whitespace().collect();
        let (group_by, footer) = if footer_parts.len() > 2
            && footer_parts[0] == "GROUP"
            && footer_parts[1] == "BY"
        {
            let mut i = 2;
            while i < footer_parts.len() && footer_parts[i].starts_with('?') {
                i += 1;
            }
            (
                format!("{} ", footer_parts[..i].join(" ")),
                footer_parts[i..].join(" "),
            )
        } else {
            (String::new(), groups[4].to_string())
        };

        Some(ParsedQuery {
            prefixes,
            select_vars_string,
            select_vars,
            body,
            group_by,
            footer,
        })
    }
}

/// Split a prefix block into one string per `PREFIX` declaration; the
/// keyword stays with its declaration. A block without any second `PREFIX`
/// comes back as a single entry (possibly empty).
fn split_before_prefix(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    for m in PREFIX_SPLIT_RE.find_iter(s) {
        parts.push(s[start..m.start()].to_string());
        start = m.end() - "PREFIX".len();
    }
    parts.push(s[start..].to_string());
    parts
}

/// Assemble a query in the nested shape used for both probe queries and the
/// final enhanced query: the original query becomes an inner SELECT, the new
/// triples join it in the outer WHERE.
pub fn build_query(
    prefixes: &[String],
    new_vars: &[String],
    new_triples: &[String],
    select_vars_string: &str,
    body: &str,
    group_by: &str,
    footer: &str,
) -> String {
    format!(
        "{}\nSELECT {} WHERE {{\n  {{ SELECT {} WHERE {{\n    {} }} {}}}\n{}\n}} {}",
        prefixes.join("\n"),
        new_vars.join(" "),
        select_vars_string,
        body,
        group_by,
        new_triples.join(" .\n"),
        footer
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_into_parts() {
        let parts = ParsedQuery::parse(
            " PREFIX a: <bla>  PREFIX bc: <http://y> \n\
             SELECT ?x_  ( COUNT( ?y_2) AS ?yy)  WHERE \n\
             { ?x wd:P31 ?p31 { SELECT ... WHERE ... } ?p31 w:P279 ?y .} \
             GROUP BY ?yy ?x OFFSET 20 LIMIT 10",
        )
        .unwrap();

        assert_eq!(parts.prefixes, vec!["PREFIX a: <bla>", "PREFIX bc: <http://y>"]);
        assert_eq!(parts.select_vars_string, "?x_ (COUNT(?y_2) AS ?yy)");
        assert_eq!(parts.select_vars, vec!["?x_", "?yy"]);
        assert_eq!(
            parts.body,
            "?x wd:P31 ?p31 { SELECT ... WHERE ... } ?p31 w:P279 ?y"
        );
        assert_eq!(parts.group_by, "GROUP BY ?yy ?x ");
        assert_eq!(parts.footer, "OFFSET 20 LIMIT 10");
    }

    #[test]
    fn test_query_without_prefixes_or_group_by() {
        let parts = ParsedQuery::parse("SELECT ?s WHERE { ?s ?p ?o } LIMIT 5").unwrap();
        assert_eq!(parts.prefixes, vec![""]);
        assert_eq!(parts.select_vars, vec!["?s"]);
        assert_eq!(parts.body, "?s ?p ?o");
        assert_eq!(parts.group_by, "");
        assert_eq!(parts.footer, "LIMIT 5");
    }

    #[test]
    fn test_group_by_needs_following_tokens() {
        // A bare "GROUP BY" with nothing after it stays in the footer.
        let parts = ParsedQuery::parse("SELECT ?s WHERE { ?s ?p ?o } GROUP BY").unwrap();
        assert_eq!(parts.group_by, "");
        assert_eq!(parts.footer, "GROUP BY");
    }

    #[test]
    fn test_unparseable_query_is_rejected() {
        assert!(ParsedQuery::parse("ASK { ?s ?p ?o }").is_none());
        assert!(ParsedQuery::parse("").is_none());
    }

    #[test]
    fn test_build_query_shape() {
        let query = build_query(
            &["PREFIX a: <bla>".to_string()],
            &["?s".to_string(), "?s_name".to_string()],
            &["  ?s a:label ?s_name".to_string()],
            "?s",
            "?s a:P31 a:Q5",
            "",
            "LIMIT 10",
        );
        let lines: Vec<&str> = query.split('\n').collect();
        assert_eq!(
            lines,
            vec![
                "PREFIX a: <bla>",
                "SELECT ?s ?s_name WHERE {",
                "  { SELECT ?s WHERE {",
                "    ?s a:P31 a:Q5 } }",
                "  ?s a:label ?s_name",
                "} LIMIT 10",
            ]
        );
    }
}
