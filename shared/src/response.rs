use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Outcome of one upstream call, normalised so that the dispatcher can apply
/// its precedence rules without looking at transport details.
///
/// `Ok` carries the upstream payload together with the header subset the
/// proxy forwards. `BackendError` is an upstream 200 whose JSON body reports
/// `"status": "ERROR"`; the body is preserved byte-for-byte. `ProxyError` is
/// synthesised by the proxy itself (timeouts, transport failures, non-200
/// statuses, unparseable YAML envelopes).
#[derive(Clone, Debug)]
pub enum BackendResponse {
    Ok {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    BackendError {
        body: Bytes,
    },
    ProxyError {
        body: Bytes,
    },
}

impl BackendResponse {
    /// Synthesise an error response in the JSON shape the SPARQL UI expects.
    /// The original query text is recovered from the request path so that the
    /// UI can display it next to the error.
    pub fn proxy_error(query_path: &str, error_msg: &str) -> Self {
        let query = query_path
            .strip_prefix("/?")
            .map(|qs| url::form_urlencoded::parse(qs.as_bytes()))
            .and_then(|mut pairs| {
                pairs
                    .find(|(key, _)| key == "query")
                    .map(|(_, value)| value.into_owned())
            })
            .unwrap_or_else(|| "[no query specified]".to_string());

        let body = serde_json::json!({
            "query": query,
            "status": "ERROR",
            "resultsize": "0",
            "time": { "total": "0ms", "computeResult": "0ms" },
            "exception": format!("SPARQL proxy error: {error_msg}"),
        });

        BackendResponse::ProxyError {
            body: Bytes::from(body.to_string()),
        }
    }

    /// Success for racing-precedence purposes.
    pub fn is_ok(&self) -> bool {
        matches!(self, BackendResponse::Ok { .. })
    }

    pub fn is_backend_error(&self) -> bool {
        matches!(self, BackendResponse::BackendError { .. })
    }

    pub fn body(&self) -> &Bytes {
        match self {
            BackendResponse::Ok { body, .. } => body,
            BackendResponse::BackendError { body } => body,
            BackendResponse::ProxyError { body } => body,
        }
    }
}
