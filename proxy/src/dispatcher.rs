use crate::yaml_envelope;
use nameservice::NameService;
use shared::backend::Backend;
use shared::response::BackendResponse;
use shared::text::{abbrev, compact_ws};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Decides, per inbound path, between single-backend forwarding and parallel
/// racing, and applies the racing precedence rules.
///
/// Three path classes:
/// 1. `/?query=yaml...` — a YAML envelope carrying one query per backend;
///    both are raced.
/// 2. `/?query=...` — a plain SPARQL query, optionally enhanced by the name
///    service, sent to backend 1 with the normal deadline.
/// 3. anything else (`/?cmd=...`) — forwarded verbatim to backend 1 only.
pub struct QueryProcessor {
    backend_1: Arc<Backend>,
    backend_2: Arc<Backend>,
    timeout_normal: Duration,
    name_service: Option<Arc<NameService>>,
}

impl QueryProcessor {
    pub fn new(
        backend_1: Arc<Backend>,
        backend_2: Arc<Backend>,
        timeout_normal: Duration,
        name_service: Option<Arc<NameService>>,
    ) -> Self {
        QueryProcessor {
            backend_1,
            backend_2,
            timeout_normal,
            name_service,
        }
    }

    pub async fn process(&self, path: &str) -> BackendResponse {
        if path.starts_with("/?query=yaml") {
            return self.process_yaml_envelope(path).await;
        }

        let enhanced_path;
        let effective_path = if let Some(name_service) = &self.name_service
            && path.starts_with("/?query=")
        {
            enhanced_path = self.enhance_path(name_service, path).await;
            enhanced_path.as_str()
        } else {
            tracing::info!("Ordinary query, processed using backend 1");
            path
        };

        self.backend_1
            .query(effective_path, self.timeout_normal, None)
            .await
    }

    /// Rewrite the first `query` parameter through the name service and
    /// re-serialise the full parameter list.
    async fn enhance_path(&self, name_service: &NameService, path: &str) -> String {
        let mut parameters: Vec<(String, String)> =
            url::form_urlencoded::parse(path[2..].as_bytes())
                .into_owned()
                .collect();
        let Some(first) = parameters.first_mut() else {
            return path.to_string();
        };

        let enhanced_query = name_service.enhance_query(&first.1).await;
        tracing::info!(
            "Name service, result query: {}",
            compact_ws(&enhanced_query)
        );
        first.1 = enhanced_query;

        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(parameters.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        format!("/?{encoded}")
    }

    async fn process_yaml_envelope(&self, path: &str) -> BackendResponse {
        tracing::info!("YAML with two queries, trying to parse it");
        let raw = path.strip_prefix("/?query=").unwrap_or(path);
        let decoded = match urlencoding::decode(raw) {
            Ok(decoded) => decoded.into_owned(),
            Err(e) => {
                let error_msg = format!("Error parsing the YAML string ({e})");
                tracing::info!("{error_msg}");
                return BackendResponse::proxy_error(path, &error_msg);
            }
        };

        match yaml_envelope::parse_envelope(&decoded) {
            Ok(queries) => {
                tracing::info!("Query 1: {}", abbrev(&queries.query_1));
                tracing::info!("Query 2: {}", abbrev(&queries.query_2));
                let path_1 = format!("/?query={}", urlencoding::encode(&queries.query_1));
                let path_2 = format!("/?query={}", urlencoding::encode(&queries.query_2));
                self.race(path_1, path_2).await
            }
            Err(e) => {
                let error_msg = e.to_string();
                tracing::info!("{error_msg}");
                tracing::info!("YAML = \n{decoded}");
                BackendResponse::proxy_error(path, &error_msg)
            }
        }
    }

    /// Race both backends, preferring backend 1.
    ///
    /// Each arm deposits `(response, backend_id)` on a rendezvous channel and
    /// always runs to its own deadline; nothing is cancelled, so a late
    /// backend-1 success can still displace an earlier backend-2 one. The
    /// consumer reads exactly one item (backend 1 succeeded first) or exactly
    /// two (every other case).
    pub async fn race(&self, path_1: String, path_2: String) -> BackendResponse {
        let (tx, mut rx) = mpsc::channel(2);
        for (backend, path) in [(&self.backend_1, &path_1), (&self.backend_2, &path_2)] {
            let backend = Arc::clone(backend);
            let path = path.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let deadline = backend.timeout();
                backend.query_and_send(path, deadline, tx).await;
            });
        }
        drop(tx);

        let Some((first, first_id)) = rx.recv().await else {
            // Both producer tasks died without sending; should not happen.
            return BackendResponse::proxy_error(&path_1, "no backend produced a response");
        };

        // True when backend 1 failed with an upstream error (rather than a
        // timeout); only used for the FALLBACK log line.
        let mut backend_1_sent_error = false;

        let (chosen, chosen_id) = if first_id == 1 {
            if first.is_ok() {
                (first, 1)
            } else {
                backend_1_sent_error = first.is_backend_error();
                match rx.recv().await {
                    // Whatever backend 2 produced, even another error.
                    Some((second, second_id)) => (second, second_id),
                    None => (first, 1),
                }
            }
        } else {
            tracing::info!("Backend 2 responded first, giving Backend 1 a chance too");
            match rx.recv().await {
                Some((second, _)) if second.is_ok() => (second, 1),
                Some((second, _)) => {
                    backend_1_sent_error = second.is_backend_error();
                    if first.is_ok() {
                        (first, 2)
                    } else {
                        // Both failed: report the primary's error.
                        (second, 1)
                    }
                }
                None => (first, 2),
            }
        };

        let outcome = if chosen.is_ok() && chosen_id == 1 {
            tracing::info!("BEST CASE: Backend 1 responded in time");
            "best"
        } else if chosen.is_ok() {
            tracing::info!(
                "FALLBACK: Backend 1 {}, taking result from Backend 2",
                if backend_1_sent_error {
                    "responded with an error"
                } else {
                    "did not respond in time"
                }
            );
            "fallback"
        } else {
            tracing::info!("WORST CASE: Neither backend responded in time");
            "worst"
        };
        metrics::counter!("racing_outcome", "outcome" => outcome).increment(1);

        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioExecutor;
    use shared::backend::BackendConfig;
    use std::convert::Infallible;
    use std::time::Instant;
    use tokio::net::TcpListener;

    /// Mock engine that waits `delay` and then answers 200 with a JSON body
    /// carrying `marker` and the request path.
    async fn start_mock_backend(delay: Duration, marker: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let uri = req.uri().to_string();
                        async move {
                            tokio::time::sleep(delay).await;
                            let body = format!(
                                "{{\"res\": [], \"marker\": \"{marker}\", \"path\": \"{uri}\"}}"
                            );
                            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                        }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        port
    }

    fn backend(port: u16, id: u32, timeout: Duration) -> Arc<Backend> {
        Arc::new(
            Backend::new(BackendConfig::new(
                format!("http://127.0.0.1:{port}"),
                timeout,
                id,
            ))
            .unwrap(),
        )
    }

    fn unreachable_backend(id: u32, timeout: Duration) -> Arc<Backend> {
        Arc::new(
            Backend::new(BackendConfig::new("http://192.0.2.1:9999", timeout, id)).unwrap(),
        )
    }

    fn processor(backend_1: Arc<Backend>, backend_2: Arc<Backend>) -> QueryProcessor {
        QueryProcessor::new(backend_1, backend_2, Duration::from_secs(1), None)
    }

    fn marker(response: &BackendResponse) -> String {
        let value: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        value["marker"].as_str().unwrap_or("").to_string()
    }

    #[tokio::test]
    async fn test_race_best_case_returns_immediately() {
        let port_1 = start_mock_backend(Duration::from_millis(50), "backend1").await;
        let port_2 = start_mock_backend(Duration::from_millis(500), "backend2").await;
        let processor = processor(
            backend(port_1, 1, Duration::from_millis(100)),
            backend(port_2, 2, Duration::from_secs(1)),
        );

        let start = Instant::now();
        let response = processor
            .race("/?query=a".to_string(), "/?query=b".to_string())
            .await;

        assert!(response.is_ok());
        assert_eq!(marker(&response), "backend1");
        // Backend 2 answers only after 500ms; a win by backend 1 must not
        // have waited for it.
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_race_falls_back_when_primary_times_out() {
        let port_1 = start_mock_backend(Duration::from_millis(500), "backend1").await;
        let port_2 = start_mock_backend(Duration::from_millis(150), "backend2").await;
        let processor = processor(
            backend(port_1, 1, Duration::from_millis(100)),
            backend(port_2, 2, Duration::from_secs(1)),
        );

        let response = processor
            .race("/?query=a".to_string(), "/?query=b".to_string())
            .await;

        assert!(response.is_ok());
        assert_eq!(marker(&response), "backend2");
    }

    #[tokio::test]
    async fn test_race_prefers_late_primary_over_early_fallback() {
        let port_1 = start_mock_backend(Duration::from_millis(90), "backend1").await;
        let port_2 = start_mock_backend(Duration::from_millis(20), "backend2").await;
        let processor = processor(
            backend(port_1, 1, Duration::from_millis(300)),
            backend(port_2, 2, Duration::from_secs(1)),
        );

        let response = processor
            .race("/?query=a".to_string(), "/?query=b".to_string())
            .await;

        assert!(response.is_ok());
        assert_eq!(marker(&response), "backend1");
    }

    #[tokio::test]
    async fn test_race_worst_case_is_a_single_proxy_error() {
        let processor = processor(
            unreachable_backend(1, Duration::from_millis(100)),
            unreachable_backend(2, Duration::from_millis(100)),
        );

        let response = processor
            .race("/?query=a".to_string(), "/?query=b".to_string())
            .await;

        assert!(!response.is_ok());
        let value: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(value["status"], "ERROR");
        assert!(!value["exception"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_path_goes_to_backend_1_only() {
        let port_1 = start_mock_backend(Duration::ZERO, "backend1").await;
        let port_2 = start_mock_backend(Duration::ZERO, "backend2").await;
        let processor = processor(
            backend(port_1, 1, Duration::from_secs(1)),
            backend(port_2, 2, Duration::from_secs(1)),
        );

        let response = processor.process("/?cmd=stats").await;
        assert_eq!(marker(&response), "backend1");

        let value: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(value["path"], "/?cmd=stats");
    }

    #[tokio::test]
    async fn test_plain_query_forwarded_verbatim_without_name_service() {
        let port_1 = start_mock_backend(Duration::ZERO, "backend1").await;
        let port_2 = start_mock_backend(Duration::ZERO, "backend2").await;
        let processor = processor(
            backend(port_1, 1, Duration::from_secs(1)),
            backend(port_2, 2, Duration::from_secs(1)),
        );

        let response = processor.process("/?query=SELECT%20%3Fx&action=json").await;
        assert_eq!(marker(&response), "backend1");

        let value: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(value["path"], "/?query=SELECT%20%3Fx&action=json");
    }

    #[tokio::test]
    async fn test_yaml_envelope_races_both_backends() {
        let port_1 = start_mock_backend(Duration::ZERO, "backend1").await;
        let port_2 = start_mock_backend(Duration::from_millis(200), "backend2").await;
        let processor = processor(
            backend(port_1, 1, Duration::from_secs(1)),
            backend(port_2, 2, Duration::from_secs(1)),
        );

        let envelope = "yaml:\n\
                        \x20 query_1: |-\n\
                        \x20   SELECT ?a WHERE { ?a ?b ?c }\n\
                        \x20 query_2: |-\n\
                        \x20   SELECT ?d WHERE { ?d ?e ?f }\n\
                        LIMIT 100";
        let path = format!("/?query={}", urlencoding::encode(envelope));
        assert!(path.starts_with("/?query=yaml"));

        let response = processor.process(&path).await;
        assert_eq!(marker(&response), "backend1");

        // Backend 1 must have received query_1 (with the footer), encoded.
        let value: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        let seen_path = value["path"].as_str().unwrap();
        assert!(seen_path.contains("%3Fa"));
        assert!(seen_path.contains("LIMIT%20100"));
    }

    #[tokio::test]
    async fn test_broken_yaml_envelope_is_a_proxy_error() {
        let port_1 = start_mock_backend(Duration::ZERO, "backend1").await;
        let port_2 = start_mock_backend(Duration::ZERO, "backend2").await;
        let processor = processor(
            backend(port_1, 1, Duration::from_secs(1)),
            backend(port_2, 2, Duration::from_secs(1)),
        );

        let path = format!("/?query={}", urlencoding::encode("yaml: [unbalanced"));
        let response = processor.process(&path).await;

        assert!(!response.is_ok());
        let value: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(value["status"], "ERROR");
        assert!(
            value["exception"]
                .as_str()
                .unwrap()
                .contains("Error parsing the YAML")
        );
    }
}
