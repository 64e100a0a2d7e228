use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use thiserror::Error;

/// Promotes the first unindented LIMIT line to its own `footer:` key.
static FOOTER_PROMOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(LIMIT)").expect("static regex"));

/// Indents unindented query lines into the surrounding block scalar. The
/// anchors are plain `\n` on purpose; CRLF envelopes are not supported and
/// fail YAML parsing downstream.
static INDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(PREFIX|LIMIT|OFFSET)").expect("static regex"));

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Error parsing the YAML string ({0})")]
    Parse(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    yaml: EnvelopeQueries,
}

#[derive(Debug, Deserialize)]
struct EnvelopeQueries {
    query_1: String,
    query_2: String,
    footer: String,
}

/// The two complete queries extracted from an envelope, each already joined
/// with the shared footer.
#[derive(Debug, PartialEq)]
pub struct RacingQueries {
    pub query_1: String,
    pub query_2: String,
}

/// Parse the URL-decoded body of a `query=yaml...` parameter. The UI sends
/// the footer and embedded PREFIX/LIMIT/OFFSET lines unindented, so the
/// document is normalised before it reaches the YAML parser.
pub fn parse_envelope(raw_yaml: &str) -> Result<RacingQueries, EnvelopeError> {
    let normalized = reindent(raw_yaml);
    tracing::debug!("YAML = \n{normalized}");

    let envelope: Envelope =
        serde_yaml::from_str(&normalized).map_err(|e| EnvelopeError::Parse(e.to_string()))?;
    let queries = envelope.yaml;

    Ok(RacingQueries {
        query_1: format!("{}\n{}", queries.query_1, queries.footer),
        query_2: format!("{}\n{}", queries.query_2, queries.footer),
    })
}

fn reindent(raw: &str) -> String {
    let promoted = FOOTER_PROMOTE_RE.replace(raw, "\n  footer: |-\n${1}");
    INDENT_RE.replace_all(&promoted, "\n    ${1}").into_owned()
}
