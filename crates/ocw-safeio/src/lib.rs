// SPDX-License-Identifier: MIT OR Apache-2.0
//! SSRF-safe outbound HTTP.
//!
//! Every outbound URL in the control plane — callbacks, LLM providers,
//! anything a caller can influence — goes through [`resolve`] or [`open`].
//! The policy re-runs in full on every redirect hop so a DNS rebind or an
//! open redirect cannot smuggle a request into a private range.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use reqwest::Url;
use reqwest::redirect::Policy as RedirectPolicy;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::debug;

/// Options recognized by the outbound policy.
#[derive(Debug, Clone)]
pub struct IoPolicy {
    /// Permit plain `http://` destinations.
    pub allow_http: bool,
    /// Exact-match host allowlist; entries may carry a `:port` suffix.
    /// Empty means "no allowlist configured" and fails every host.
    pub allowed_hosts: BTreeSet<String>,
    /// Provider ids that may resolve to loopback (local engines).
    pub allow_loopback_for: BTreeSet<String>,
    /// Permit private/reserved ranges (trusted LAN deployments only).
    pub allow_private: bool,
    /// Maximum redirect hops before giving up.
    pub max_redirects: usize,
}

impl Default for IoPolicy {
    fn default() -> Self {
        Self {
            allow_http: false,
            allowed_hosts: BTreeSet::new(),
            allow_loopback_for: BTreeSet::new(),
            allow_private: false,
            max_redirects: 3,
        }
    }
}

impl IoPolicy {
    /// Policy allowing the given hosts over https.
    #[must_use]
    pub fn for_hosts(hosts: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed_hosts: hosts.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Why a URL was rejected. The reason string propagates unchanged to the
/// client as `ssrf_blocked{reason}`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SafeIoError {
    /// The URL failed policy evaluation.
    #[error("ssrf_blocked: {reason}")]
    Blocked {
        /// Stable reason tag (`scheme`, `private_address`, `host_not_allowed`,
        /// `resolve_failed`, `too_many_redirects`).
        reason: String,
    },
    /// The transport failed after the policy admitted the URL.
    #[error("outbound request failed: {0}")]
    Transport(String),
}

impl SafeIoError {
    fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked {
            reason: reason.into(),
        }
    }
}

/// Outcome of policy evaluation for one URL.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Hostname from the URL.
    pub host: String,
    /// Port (explicit or scheme default).
    pub port: u16,
    /// Every address the host resolved to.
    pub addresses: Vec<IpAddr>,
}

/// Returns `true` for loopback addresses.
fn ip_is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Returns `true` for private, reserved, or otherwise non-public ranges.
fn ip_is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || is_cgnat(v4)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || is_unique_local(v6) || is_v6_link_local(v6)
        }
    }
}

// 100.64.0.0/10
fn is_cgnat(v4: Ipv4Addr) -> bool {
    let octets = v4.octets();
    octets[0] == 100 && (octets[1] & 0xc0) == 64
}

// fc00::/7
fn is_unique_local(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_v6_link_local(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

fn host_allowed(host: &str, port: u16, policy: &IoPolicy) -> bool {
    policy.allowed_hosts.contains(host)
        || policy.allowed_hosts.contains(&format!("{host}:{port}"))
}

/// Evaluate the full policy for one URL and return its resolved addresses.
///
/// `provider` scopes the loopback exemption: a provider listed in
/// `allow_loopback_for` may target loopback even when private ranges are
/// otherwise blocked.
///
/// # Errors
///
/// Returns [`SafeIoError::Blocked`] when any check fails.
pub async fn resolve(
    url: &Url,
    policy: &IoPolicy,
    provider: Option<&str>,
) -> Result<ResolvedTarget, SafeIoError> {
    match url.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        other => {
            return Err(SafeIoError::blocked(format!("scheme:{other}")));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| SafeIoError::blocked("no_host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| SafeIoError::blocked("no_port"))?;

    if !host_allowed(&host, port, policy) {
        return Err(SafeIoError::blocked(format!("host_not_allowed:{host}")));
    }

    let loopback_ok = policy.allow_private
        || provider.is_some_and(|p| policy.allow_loopback_for.contains(p));

    // Literal addresses skip DNS but not the range check.
    let addresses: Vec<IpAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
        vec![ip]
    } else {
        tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| SafeIoError::blocked(format!("resolve_failed:{e}")))?
            .map(|addr| addr.ip())
            .collect()
    };

    if addresses.is_empty() {
        return Err(SafeIoError::blocked("resolve_failed:empty"));
    }

    for ip in &addresses {
        if ip_is_loopback(*ip) {
            if !loopback_ok {
                return Err(SafeIoError::blocked(format!("private_address:{ip}")));
            }
        } else if ip_is_private(*ip) && !policy.allow_private {
            return Err(SafeIoError::blocked(format!("private_address:{ip}")));
        }
    }

    debug!(host = %host, port, addrs = addresses.len(), "outbound target admitted");
    Ok(ResolvedTarget {
        host,
        port,
        addresses,
    })
}

/// Build a client suitable for policy-checked requests.
///
/// Redirects are disabled at the transport layer; [`open`] follows them
/// manually so each hop is revalidated.
#[must_use]
pub fn policy_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(RedirectPolicy::none())
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// A request to send through the policy.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method.
    pub method: reqwest::Method,
    /// Destination URL.
    pub url: Url,
    /// Headers to attach.
    pub headers: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    /// A POST with a JSON body.
    #[must_use]
    pub fn post_json(url: Url, body: Vec<u8>) -> Self {
        Self {
            method: reqwest::Method::POST,
            url,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(body),
        }
    }
}

/// Send a request, re-running the full policy on every redirect hop.
///
/// # Errors
///
/// Returns [`SafeIoError::Blocked`] when the original URL or any redirect
/// target fails policy, and [`SafeIoError::Transport`] on network failure.
pub async fn open(
    client: &reqwest::Client,
    request: OutboundRequest,
    policy: &IoPolicy,
    provider: Option<&str>,
) -> Result<reqwest::Response, SafeIoError> {
    let mut url = request.url.clone();
    for _hop in 0..=policy.max_redirects {
        resolve(&url, policy, provider).await?;

        let mut builder = client.request(request.method.clone(), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| SafeIoError::Transport(e.to_string()))?;

        if response.status().is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| SafeIoError::blocked("redirect_without_location"))?;
            url = url
                .join(location)
                .map_err(|_| SafeIoError::blocked("redirect_bad_location"))?;
            continue;
        }
        return Ok(response);
    }
    Err(SafeIoError::blocked("too_many_redirects"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(hosts: &[&str]) -> IoPolicy {
        IoPolicy {
            allow_http: true,
            allowed_hosts: hosts.iter().map(|s| (*s).to_string()).collect(),
            ..IoPolicy::default()
        }
    }

    #[test]
    fn private_range_classification() {
        for ip in ["10.0.0.1", "172.16.5.9", "192.168.1.1", "169.254.0.7", "100.64.1.1", "127.0.0.1", "0.0.0.0"] {
            assert!(ip_is_private(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "93.184.216.34", "2600:1406::1"] {
            assert!(!ip_is_private(ip.parse().unwrap()), "{ip}");
        }
        assert!(ip_is_private("::1".parse().unwrap()));
        assert!(ip_is_private("fd12:3456::1".parse().unwrap()));
        assert!(ip_is_private("fe80::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let url = Url::parse("ftp://files.example/x").unwrap();
        let err = resolve(&url, &policy(&["files.example"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SafeIoError::Blocked { reason } if reason.starts_with("scheme:")));
    }

    #[tokio::test]
    async fn rejects_http_when_not_allowed() {
        let mut p = policy(&["site.example"]);
        p.allow_http = false;
        let url = Url::parse("http://site.example/x").unwrap();
        let err = resolve(&url, &p, None).await.unwrap_err();
        assert!(matches!(err, SafeIoError::Blocked { .. }));
    }

    #[tokio::test]
    async fn rejects_host_not_on_allowlist() {
        let url = Url::parse("http://evil.example/x").unwrap();
        let err = resolve(&url, &policy(&["good.example"]), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, SafeIoError::Blocked { ref reason } if reason == "host_not_allowed:evil.example"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn rejects_private_literal_address() {
        let url = Url::parse("http://10.0.0.1/hook").unwrap();
        let err = resolve(&url, &policy(&["10.0.0.1"]), None).await.unwrap_err();
        assert!(
            matches!(err, SafeIoError::Blocked { ref reason } if reason.starts_with("private_address:")),
            "{err}"
        );
    }

    #[tokio::test]
    async fn loopback_allowed_only_for_listed_provider() {
        let mut p = policy(&["127.0.0.1"]);
        p.allow_loopback_for.insert("local_engine".into());
        let url = Url::parse("http://127.0.0.1:8188/prompt").unwrap();

        assert!(resolve(&url, &p, Some("local_engine")).await.is_ok());
        assert!(resolve(&url, &p, Some("other")).await.is_err());
        assert!(resolve(&url, &p, None).await.is_err());
    }

    #[tokio::test]
    async fn allow_private_admits_lan_targets() {
        let mut p = policy(&["192.168.1.40"]);
        p.allow_private = true;
        let url = Url::parse("http://192.168.1.40/hook").unwrap();
        assert!(resolve(&url, &p, None).await.is_ok());
    }

    #[tokio::test]
    async fn port_qualified_allowlist_entries() {
        let p = policy(&["203.0.113.7:8443"]);
        let hit = Url::parse("http://203.0.113.7:8443/x").unwrap();
        let miss = Url::parse("http://203.0.113.7:9000/x").unwrap();
        assert!(resolve(&hit, &p, None).await.is_ok());
        assert!(resolve(&miss, &p, None).await.is_err());
    }

    #[tokio::test]
    async fn open_follows_and_revalidates_redirects() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "http://10.0.0.1/private"),
            )
            .mount(&server)
            .await;

        let uri = server.uri();
        let server_url = Url::parse(&uri).unwrap();
        let host = server_url.host_str().unwrap().to_string();
        let port = server_url.port().unwrap();

        let mut p = policy(&[&format!("{host}:{port}")]);
        p.allow_private = false;
        // The mock server listens on loopback; exempt it as a provider.
        p.allow_loopback_for.insert("test".into());

        let client = policy_client(Duration::from_secs(5));
        let request = OutboundRequest {
            method: reqwest::Method::GET,
            url: server_url.join("/start").unwrap(),
            headers: vec![],
            body: None,
        };
        let err = open(&client, request, &p, Some("test")).await.unwrap_err();
        // The redirect target 10.0.0.1 must be rejected by revalidation.
        assert!(
            matches!(err, SafeIoError::Blocked { ref reason } if reason.starts_with("host_not_allowed") || reason.starts_with("private_address")),
            "{err}"
        );
    }
}
