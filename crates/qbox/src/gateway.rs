//! HTTP front-end: dispatches matched requests to a saga coordinator and
//! transparently proxies the rest.
//!
//! Every method and path lands in the fallback handler; there is no route
//! table. The gateway owns response shaping: on saga completion it resolves
//! the configured `onAllSucceeded` / `onAnyFailed` template against the
//! finished request tree.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use http::StatusCode;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::client::HttpClient;
use crate::config::ConfigStore;
use crate::interpolate::InterpolationContext;
use crate::matcher::{absolute_url, match_config, InboundRequest};
use crate::saga::SagaCoordinator;
use crate::tree::{Headers, RequestNode};

/// Listen address of the sidecar.
pub const LISTEN_ADDRESS: &str = "0.0.0.0:3001";

/// Status reported when the passthrough proxy cannot reach the upstream.
const PROXY_FAILURE_STATUS: u16 = 599;

/// Cap on a single proxied exchange. Saga dispatches carry their own
/// configured timeouts.
const PROXY_TIMEOUT: Duration = Duration::from_secs(60);

/// Recomputed by the outbound client, so never forwarded.
const STRIPPED_REQUEST_HEADERS: [&str; 3] = ["host", "connection", "content-length"];
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["connection", "content-length", "transfer-encoding"];

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub client: Arc<dyn HttpClient>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(%err, "failed to buffer inbound body");
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let headers: Headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let url = if parts.uri.scheme().is_some() {
        parts.uri.to_string()
    } else {
        let host = headers.get("host").unwrap_or("");
        let path = parts
            .uri
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        absolute_url(host, path)
    };

    let inbound = InboundRequest {
        method: parts.method.as_str().to_string(),
        url,
        headers,
        body,
    };

    match match_config(&inbound, state.store.configs()) {
        Some(index) => run_saga(&state, index, inbound).await,
        None => proxy(&state, inbound).await,
    }
}

/// Execute the matched saga and shape the final response from the
/// configured template.
async fn run_saga(state: &AppState, index: usize, inbound: InboundRequest) -> Response {
    let config = Arc::new(state.store.configs()[index].clone());
    let mut coordinator = SagaCoordinator::new(
        Arc::clone(&config),
        Arc::clone(&state.client),
        inbound.headers,
        inbound.body,
    );
    let outcome = coordinator.execute().await;

    let template = if outcome.success {
        config.on_all_succeeded.as_ref()
    } else {
        config.on_any_failed.as_ref()
    };
    let Some(template) = template else {
        return status_response(StatusCode::OK);
    };

    let tree = coordinator.tree();
    let detached = RequestNode::new("", "");
    let context = InterpolationContext {
        root: tree.get(tree.root()),
        parent: &detached,
        transactions: outcome.completed.iter().map(|&id| tree.get(id)).collect(),
    };

    let body = template
        .body
        .as_deref()
        .map(|body| context.interpolate(body))
        .unwrap_or_default();

    let mut builder = Response::builder().status(template.status_code);
    for (name, value) in &template.headers {
        builder = builder.header(name, context.interpolate(value));
    }
    match builder.body(Body::from(body)) {
        Ok(response) => response,
        Err(err) => {
            error!(%err, "failed to build saga response");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Forward an unmatched request upstream and stream the answer back.
async fn proxy(state: &AppState, inbound: InboundRequest) -> Response {
    debug!(method = %inbound.method, url = %inbound.url, "proxying unmatched request");

    let headers: Headers = inbound
        .headers
        .iter()
        .filter(|(name, _)| !STRIPPED_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    match state
        .client
        .execute(&inbound.method, &inbound.url, &headers, inbound.body, PROXY_TIMEOUT)
        .await
    {
        Ok(upstream) => {
            let mut builder = Response::builder().status(upstream.status);
            for (name, value) in upstream.headers.iter() {
                if STRIPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                    continue;
                }
                builder = builder.header(name, value);
            }
            match builder.body(Body::from(upstream.body)) {
                Ok(response) => response,
                Err(err) => {
                    error!(%err, "failed to rebuild upstream response");
                    status_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        }
        Err(err) => {
            warn!(%err, url = %inbound.url, "proxy dispatch failed");
            Response::builder()
                .status(PROXY_FAILURE_STATUS)
                .body(Body::from(format!("upstream request failed: {err}")))
                .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn status_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::client::testing::{response_with_body, RecordingClient};
    use crate::client::{ClientError, HttpResponse};
    use crate::saga::{MESSAGE_TYPE_HEADER, TRANSACTION_ID_HEADER};

    const CONFIG: &str = r#"
host: productpage.svc
matchRequest:
  method: GET
  url: http://localhost:3001/
  headers:
    Start-Faking: "True"
onMatchedRequest:
  - method: GET
    url: http://ratings.svc/add/${parent.headers.Product-Id}
    timeout: 30000
    isSuccessIfReceives:
      - status-code: 200
    onFailure:
      - method: GET
        url: http://ratings.svc/delete/${root.headers.Product-Id}
        timeout: 3000
        isSuccessIfReceives:
          - status-code: 200
  - method: GET
    url: http://details.svc/details/add/${root.headers.Product-Id}
    timeout: 30000
    isSuccessIfReceives:
      - status-code: 200
    onFailure:
      - method: GET
        url: http://details.svc/details/remove/${root.headers.Product-Id}
        timeout: 3000
        isSuccessIfReceives:
          - status-code: 200
onAllSucceeded:
  status-code: 200
  body: "Ratings: ${transaction[0].response.body}\nDetails: ${transaction[1].response.body}\n"
onAnyFailed:
  status-code: 500
  body: "Ratings: ${transaction[0].response.body:none}\nDetails: ${transaction[1].response.body:none}\n"
"#;

    fn app(client: Arc<RecordingClient>, config: &str) -> Router {
        let store = ConfigStore::parse(config).unwrap();
        router(AppState {
            store: Arc::new(store),
            client,
        })
    }

    fn saga_request() -> Request {
        http::Request::builder()
            .method("GET")
            .uri("/")
            .header("Host", "localhost:3001")
            .header("Start-Faking", "True")
            .header("Product-Id", "12")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn saga_success_shapes_the_configured_response() {
        let client = Arc::new(RecordingClient::new());
        client.respond(
            "http://ratings.svc/add/12",
            Ok(response_with_body(200, "bar")),
        );
        client.respond(
            "http://details.svc/details/add/12",
            Ok(response_with_body(200, "foo")),
        );

        let response = app(client.clone(), CONFIG)
            .oneshot(saga_request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_string(response).await,
            "Ratings: bar\nDetails: foo\n"
        );
        assert_eq!(
            client.urls(),
            vec![
                "http://ratings.svc/add/12",
                "http://details.svc/details/add/12",
            ]
        );
    }

    #[tokio::test]
    async fn saga_failure_selects_on_any_failed() {
        let client = Arc::new(RecordingClient::new());
        client.respond(
            "http://ratings.svc/add/12",
            Ok(response_with_body(404, "")),
        );

        let response = app(client.clone(), CONFIG)
            .oneshot(saga_request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // No transaction completed, so both indices fall back to defaults.
        assert_eq!(
            body_string(response).await,
            "Ratings: none\nDetails: none\n"
        );
    }

    #[tokio::test]
    async fn absent_template_yields_empty_200() {
        let client = Arc::new(RecordingClient::new());
        let config = r#"
host: me.svc
matchRequest:
  method: GET
  url: http://localhost:3001/
onMatchedRequest:
  - method: POST
    url: http://foo.svc/transact
    timeout: 30000
    isSuccessIfReceives:
      - status-code: 200
    onFailure: []
"#;

        let request = http::Request::builder()
            .method("GET")
            .uri("/")
            .header("Host", "localhost:3001")
            .body(Body::empty())
            .unwrap();
        let response = app(client, config).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn unmatched_requests_are_proxied_without_saga_headers() {
        let client = Arc::new(RecordingClient::new());
        client.respond(
            "http://backend.svc/resource",
            Ok(HttpResponse {
                status: 200,
                headers: Headers::from([("Content-Type", "text/plain")]),
                body: Bytes::from_static(b"ok"),
            }),
        );

        let request = http::Request::builder()
            .method("GET")
            .uri("/resource")
            .header("Host", "backend.svc")
            .header("Accept", "*/*")
            .body(Body::empty())
            .unwrap();

        let store = ConfigStore::from_configs(Vec::new());
        let response = router(AppState {
            store: Arc::new(store),
            client: client.clone(),
        })
        .oneshot(request)
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain"
        );
        assert_eq!(body_string(response).await, "ok");

        let call = &client.calls()[0];
        assert_eq!(call.url, "http://backend.svc/resource");
        assert_eq!(call.headers.get(TRANSACTION_ID_HEADER), None);
        assert_eq!(call.headers.get(MESSAGE_TYPE_HEADER), None);
        assert_eq!(call.headers.get("host"), None);
        assert_eq!(call.headers.get("Accept"), Some("*/*"));
    }

    #[tokio::test]
    async fn proxy_transport_failure_reports_599() {
        let client = Arc::new(RecordingClient::new());
        client.respond(
            "http://backend.svc/resource",
            Err(ClientError::Transport("connection refused".to_string())),
        );

        let request = http::Request::builder()
            .method("GET")
            .uri("/resource")
            .header("Host", "backend.svc")
            .body(Body::empty())
            .unwrap();

        let store = ConfigStore::from_configs(Vec::new());
        let response = router(AppState {
            store: Arc::new(store),
            client,
        })
        .oneshot(request)
        .await
        .unwrap();

        assert_eq!(response.status().as_u16(), 599);
        assert!(body_string(response).await.contains("connection refused"));
    }
}
