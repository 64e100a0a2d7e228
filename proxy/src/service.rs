use crate::dispatcher::QueryProcessor;
use bytes::Bytes;
use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, HeaderValue};
use http_body_util::Full;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::response::BackendResponse;
use shared::text::abbrev_unquoted;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Per-connection request handler. Holds an immutable reference to the
/// dispatcher; there is no per-request state beyond the stack.
///
/// Every outcome is written as HTTP 200 with an
/// `Access-Control-Allow-Origin` header — the UI only renders embedded
/// errors when the envelope itself is a 200 with JSON.
pub struct ProxyService {
    processor: Arc<QueryProcessor>,
}

impl ProxyService {
    pub fn new(processor: Arc<QueryProcessor>) -> Self {
        ProxyService { processor }
    }
}

impl<B> Service<Request<B>> for ProxyService {
    type Response = Response<Full<Bytes>>;
    type Error = std::convert::Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<B>) -> Self::Future {
        let processor = self.processor.clone();
        let method = request.method().clone();
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Box::pin(async move {
            let start_time = Instant::now();
            tracing::info!("GET request received: {}", abbrev_unquoted(&path));

            let response = if method == Method::GET {
                processor.process(&path).await
            } else {
                BackendResponse::proxy_error(
                    &path,
                    &format!("only GET requests are supported, got {method}"),
                )
            };
            let http_response = write_response(response);

            let elapsed = start_time.elapsed().as_millis();
            tracing::info!("Total time spent on request: {elapsed}ms");
            metrics::counter!("requests_total").increment(1);
            metrics::histogram!("request_duration_ms").record(elapsed as f64);

            Ok(http_response)
        })
    }
}

fn write_response(response: BackendResponse) -> Response<Full<Bytes>> {
    match response {
        BackendResponse::Ok { headers, body, .. } => {
            let mut http_response = Response::new(Full::new(body));
            *http_response.status_mut() = StatusCode::OK;
            for (name, value) in headers.iter() {
                http_response.headers_mut().insert(name, value.clone());
            }
            if !http_response
                .headers()
                .contains_key(ACCESS_CONTROL_ALLOW_ORIGIN)
            {
                http_response
                    .headers_mut()
                    .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            }
            tracing::debug!("Forwarded result to caller");
            http_response
        }
        BackendResponse::ProxyError { body } | BackendResponse::BackendError { body } => {
            tracing::info!("Sending error JSON to caller");
            let mut http_response = Response::new(Full::new(body));
            *http_response.status_mut() = StatusCode::OK;
            http_response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            http_response
                .headers_mut()
                .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            http_response
        }
    }
}
