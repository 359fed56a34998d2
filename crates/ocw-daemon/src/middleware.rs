// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request-id injection, structured request logging, and caller metadata
//! extraction shared by the handler modules.

use crate::AppState;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use ocw_auth::RequestAuth;
use ocw_core::TraceId;
use ocw_gate::resolve_client_ip;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Axum middleware that tags each request with an `X-Request-Id`.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    req.extensions_mut().insert(RequestId(id));
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Axum middleware that logs method, path, status, and duration.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

/// The connected peer address, when the listener recorded one.
///
/// In-process tests drive the router without a socket; the absence of a
/// peer is treated as loopback.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> axum::extract::FromRequestParts<S> for PeerAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Resolve the effective client IP, honoring `X-Forwarded-For` only when
/// the peer is a trusted proxy and the trust flag is on.
pub fn client_ip(state: &AppState, peer: PeerAddr, headers: &HeaderMap) -> IpAddr {
    let peer_ip = peer
        .0
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));
    if !state.settings.trust_xff {
        return peer_ip;
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    resolve_client_ip(peer_ip, forwarded, &state.settings.trusted_proxies)
}

/// Extract the authentication material a verifier needs.
pub fn request_auth(client: IpAddr, headers: &HeaderMap) -> RequestAuth {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let bearer = header("authorization").and_then(|value| {
        value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .map(str::to_string)
    });
    RequestAuth {
        peer_is_loopback: client.is_loopback(),
        bearer,
        origin: header("origin"),
        sec_fetch_site: header("sec-fetch-site"),
        timestamp: header("x-timestamp"),
        nonce: header("x-nonce"),
        signature: header("x-signature"),
    }
}

/// Trace id from the `X-Trace-Id` header, or a freshly minted one.
pub fn trace_from_headers(headers: &HeaderMap) -> TraceId {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .and_then(TraceId::from_header)
        .unwrap_or_else(TraceId::mint)
}

/// Idempotency key from the `Idempotency-Key` header.
pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty() && k.len() <= 256)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_extraction() {
        let auth = request_auth(
            "127.0.0.1".parse().unwrap(),
            &headers(&[("authorization", "Bearer tok-1")]),
        );
        assert_eq!(auth.bearer.as_deref(), Some("tok-1"));
        assert!(auth.peer_is_loopback);
    }

    #[test]
    fn trace_header_used_when_valid() {
        let trace = trace_from_headers(&headers(&[("x-trace-id", "t-abc")]));
        assert_eq!(trace.as_str(), "t-abc");
        let minted = trace_from_headers(&headers(&[]));
        assert!(minted.as_str().starts_with("t-"));
    }

    #[test]
    fn idempotency_key_bounds() {
        assert_eq!(
            idempotency_key(&headers(&[("idempotency-key", " k1 ")])).as_deref(),
            Some("k1")
        );
        assert!(idempotency_key(&headers(&[])).is_none());
        let long = "x".repeat(300);
        assert!(idempotency_key(&headers(&[("idempotency-key", long.as_str())])).is_none());
    }
}
