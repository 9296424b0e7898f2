//! Decides whether an inbound request initiates a configured saga.

use bytes::Bytes;

use crate::config::SagaConfig;
use crate::tree::Headers;

/// The gateway's view of an inbound request, with the URL already fully
/// qualified.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Reconstruct the fully-qualified URL for an inbound request that carries
/// only a path. TLS termination is out of scope, so the scheme is `http`.
pub fn absolute_url(host: &str, path: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}{path}")
    } else {
        format!("http://{host}{path}")
    }
}

/// Return the index of the first configuration whose `matchRequest` matches,
/// scanning in configuration order. Pure function of its inputs.
pub fn match_config(request: &InboundRequest, configs: &[SagaConfig]) -> Option<usize> {
    configs
        .iter()
        .position(|config| matches(request, config))
}

fn matches(request: &InboundRequest, config: &SagaConfig) -> bool {
    let pattern = &config.match_request;

    if pattern.url != request.url {
        return false;
    }
    // Methods are uppercase in both places; comparison stays case-sensitive.
    if pattern.method != request.method {
        return false;
    }
    for (name, value) in &pattern.headers {
        if request.headers.get(name) != Some(value.as_str()) {
            return false;
        }
    }
    if let Some(body) = &pattern.body {
        if !body.is_empty() && request.body != body.as_bytes() {
            return false;
        }
    }
    true
}
