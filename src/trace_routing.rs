//! Trace-based sticky routing
//!
//! One logical request stays pinned to one flow's service versions across
//! hops by carrying a trace id:
//!
//! 1. An edge request without the canonical trace header gets the first
//!    recognized tracing header promoted to it.
//! 2. A request with no recognized tracing header at all is rejected at the
//!    inbound boundary.
//! 3. Each outbound hop asks the trace router which version serves
//!    `(trace id, hostname)` and records the answer in the destination
//!    header. When the router cannot answer, the hop goes to the base
//!    version; routing never fails because of the router.
//!
//! The rendered Lua filters run this procedure inside the proxies; this
//! module runs the same procedure over plain header maps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EngineConfig;

/// Canonical trace id header
pub const TRACE_ID_HEADER: &str = "x-kardinal-trace-id";

/// Header carrying the resolved `{service}-{version}` destination
pub const DESTINATION_HEADER: &str = "x-kardinal-destination";

/// Request authority pseudo-header
pub const AUTHORITY_HEADER: &str = ":authority";

/// Well-known tracing headers, in promotion order
pub const TRACE_HEADER_PRIORITIES: &[&str] = &[
    "x-trace-id",
    "x-b3-traceid",
    "x-request-id",
    "x-cloud-trace-context",
    "x-amzn-trace-id",
    "traceparent",
    "uber-trace-id",
    "x-datadog-trace-id",
];

/// Request headers keyed by lowercase name
pub type Headers = BTreeMap<String, String>;

/// The trace router could not resolve a destination
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("trace router unavailable: {0}")]
pub struct UpstreamUnavailable(pub String);

/// Inbound request rejected for lacking any trace id
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("missing required x-kardinal-trace-id header")]
pub struct MissingTraceId;

fn header<'h>(headers: &'h Headers, name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

/// Trace id of a request and the header it was found in
pub fn find_trace_id(headers: &Headers) -> Option<(&str, &'static str)> {
    if let Some(id) = header(headers, TRACE_ID_HEADER) {
        return Some((id, TRACE_ID_HEADER));
    }
    TRACE_HEADER_PRIORITIES
        .iter()
        .find_map(|name| header(headers, name).map(|id| (id, *name)))
}

/// Ensure the canonical trace header is set, promoting a recognized one.
///
/// Returns the trace id, or `None` when the request carries no tracing header.
pub fn promote_trace_header(headers: &mut Headers) -> Option<String> {
    let (trace_id, source) = find_trace_id(headers)?;
    let trace_id = trace_id.to_string();
    if source != TRACE_ID_HEADER {
        debug!(source, trace_id = %trace_id, "promoting trace header");
        headers.insert(TRACE_ID_HEADER.to_string(), trace_id.clone());
    }
    Some(trace_id)
}

/// Inbound boundary check: promote, or reject the request
pub fn check_inbound(headers: &mut Headers) -> Result<String, MissingTraceId> {
    promote_trace_header(headers).ok_or(MissingTraceId)
}

/// Strip any `:port` suffix from an authority
pub fn strip_port(hostname: &str) -> &str {
    hostname.split(':').next().unwrap_or(hostname)
}

/// Out-of-band resolver of per-trace destinations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TraceRouter: Send + Sync {
    /// Destination (`{service}-{version}`) serving `hostname` for `trace_id`
    async fn route(&self, trace_id: &str, hostname: &str) -> Result<String, UpstreamUnavailable>;
}

/// Resolves hop destinations through a [`TraceRouter`] with a bounded wait
pub struct StickyRouter {
    router: Arc<dyn TraceRouter>,
    fallback_version: String,
    timeout: Duration,
}

impl StickyRouter {
    /// Create a resolver falling back to `fallback_version`
    pub fn new(
        router: Arc<dyn TraceRouter>,
        fallback_version: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            router,
            fallback_version: fallback_version.into(),
            timeout,
        }
    }

    /// Resolver using the configured base version and router timeout
    pub fn from_config(router: Arc<dyn TraceRouter>, config: &EngineConfig) -> Self {
        Self::new(router, &config.base_version, config.trace_router.timeout())
    }

    /// Fallback destination for a hostname
    pub fn fallback(&self, hostname: &str) -> String {
        format!("{}-{}", strip_port(hostname), self.fallback_version)
    }

    /// Destination for one hop; falls back to the base version on any failure
    pub async fn resolve_destination(&self, trace_id: &str, hostname: &str) -> String {
        let hostname = strip_port(hostname);
        let outcome = tokio::time::timeout(self.timeout, self.router.route(trace_id, hostname))
            .await
            .unwrap_or_else(|_| {
                Err(UpstreamUnavailable(format!(
                    "no answer within {:?}",
                    self.timeout
                )))
            });

        match outcome {
            Ok(destination) if !destination.is_empty() => destination,
            Ok(_) => {
                warn!(trace_id, hostname, "trace router returned an empty destination");
                self.fallback(hostname)
            }
            Err(e) => {
                warn!(trace_id, hostname, error = %e, "using fallback destination");
                self.fallback(hostname)
            }
        }
    }

    /// Outbound hop: set the destination header when the request is traced.
    ///
    /// Returns the destination written, if any.
    pub async fn route_outbound(&self, headers: &mut Headers) -> Option<String> {
        let trace_id = header(headers, TRACE_ID_HEADER)?.to_string();
        let hostname = header(headers, AUTHORITY_HEADER)?.to_string();
        let destination = self.resolve_destination(&trace_id, &hostname).await;
        headers.insert(DESTINATION_HEADER.to_string(), destination.clone());
        Some(destination)
    }
}
