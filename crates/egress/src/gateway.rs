use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION},
};
use ipnet::IpNet;
use opentelemetry_semantic_conventions::attribute as trace;
use tracing::{Instrument, Span, debug, field::Empty, info, info_span};
use url::Url;

use crate::{
    TRACE_TARGET_FETCH,
    abort::{AbortController, AbortReason, AbortSignal},
    admission::{AdmissionController, AdmissionLimits, RateLimit},
    error::{Error, Result},
    form,
    net::{AddressPolicy, AddressPolicyBuilder, DomainPattern, Resolver},
    request::{CredentialsPolicy, FetchParams, RedirectPolicy, RequestBody, RequestMode},
    response::{self, FetchResult},
    transport::{Transport, TransportRequest, TransportResponse},
};

const DEFAULT_TEXT_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";

/// Headers the gateway adds to every request. They replace caller headers of
/// the same name.
#[derive(Clone)]
pub enum StaticHeaders {
    Fixed(HeaderMap),
    Computed(Arc<dyn Fn(&Url) -> HeaderMap + Send + Sync>),
}

impl core::fmt::Debug for StaticHeaders {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Fixed(headers) => f.debug_tuple("Fixed").field(headers).finish(),
            Self::Computed(_) => f.debug_tuple("Computed").finish_non_exhaustive(),
        }
    }
}

impl StaticHeaders {
    fn for_url(&self, url: &Url) -> HeaderMap {
        match self {
            Self::Fixed(headers) => headers.clone(),
            Self::Computed(f) => f(url),
        }
    }
}

/// Replace every header named in `overrides`, keeping all of its values.
fn merge_headers(target: &mut HeaderMap, overrides: &HeaderMap) {
    for name in overrides.keys() {
        target.remove(name);
        for value in overrides.get_all(name) {
            target.append(name.clone(), value.clone());
        }
    }
}

#[must_use]
pub struct GatewayBuilder {
    policy: AddressPolicyBuilder,
    limits: AdmissionLimits,
    max_content_length: Option<u64>,
    static_headers: Option<StaticHeaders>,
    transport: Arc<dyn Transport>,
}

impl GatewayBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            policy: AddressPolicyBuilder::new(),
            limits: AdmissionLimits::default(),
            max_content_length: None,
            static_headers: None,
            transport,
        }
    }

    /// Admit at most `quota` requests per `window`.
    pub const fn rate_pool(mut self, window: Duration, quota: usize) -> Self {
        self.limits.rate = Some(RateLimit { window, quota });
        self
    }

    pub const fn max_active(mut self, max_active: usize) -> Self {
        self.limits.max_active = Some(max_active);
        self
    }

    pub const fn max_awaiting(mut self, max_awaiting: usize) -> Self {
        self.limits.max_awaiting = Some(max_awaiting);
        self
    }

    pub fn allow_direct_ip(mut self, allow: bool) -> Self {
        self.policy = self.policy.allow_direct_ip(allow);
        self
    }

    pub fn ip_allow(mut self, nets: impl IntoIterator<Item = IpNet>) -> Self {
        self.policy = self.policy.ip_allow(nets);
        self
    }

    pub fn ip_deny(mut self, nets: impl IntoIterator<Item = IpNet>) -> Self {
        self.policy = self.policy.ip_deny(nets);
        self
    }

    pub fn deny_private_ranges(mut self) -> Self {
        self.policy = self.policy.deny_private_ranges();
        self
    }

    pub fn domain_allow(mut self, patterns: impl IntoIterator<Item = DomainPattern>) -> Self {
        self.policy = self.policy.domain_allow(patterns);
        self
    }

    pub fn domain_deny(mut self, patterns: impl IntoIterator<Item = DomainPattern>) -> Self {
        self.policy = self.policy.domain_deny(patterns);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.policy = self.policy.resolver(resolver);
        self
    }

    pub fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.policy = self.policy.dns_timeout(timeout);
        self
    }

    /// Reject responses whose `content-length` is missing, malformed or
    /// above `max` bytes.
    pub const fn max_content_length(mut self, max: u64) -> Self {
        self.max_content_length = Some(max);
        self
    }

    pub fn static_headers(mut self, headers: HeaderMap) -> Self {
        self.static_headers = Some(StaticHeaders::Fixed(headers));
        self
    }

    pub fn static_headers_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Url) -> HeaderMap + Send + Sync + 'static,
    {
        self.static_headers = Some(StaticHeaders::Computed(Arc::new(f)));
        self
    }

    #[must_use]
    pub fn build(self) -> Gateway {
        Gateway {
            policy: self.policy.build(),
            admission: AdmissionController::new(self.limits),
            transport: self.transport,
            static_headers: self.static_headers,
            max_content_length: self.max_content_length,
            disposed: AtomicBool::new(false),
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

/// A `fetch` call between entry and settlement. Deregisters on drop.
struct PendingRequest<'a> {
    registry: &'a DashMap<u64, Arc<AbortController>>,
    id: u64,
    controller: Arc<AbortController>,
}

impl PendingRequest<'_> {
    fn signal(&self) -> AbortSignal {
        self.controller.signal()
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Outbound HTTP gateway. Dropping it disposes it.
pub struct Gateway {
    policy: AddressPolicy,
    admission: AdmissionController,
    transport: Arc<dyn Transport>,
    static_headers: Option<StaticHeaders>,
    max_content_length: Option<u64>,
    disposed: AtomicBool,
    pending: DashMap<u64, Arc<AbortController>>,
    next_id: AtomicU64,
}

impl core::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gateway")
            .field("policy", &self.policy)
            .field("admission", &self.admission)
            .field("static_headers", &self.static_headers)
            .field("max_content_length", &self.max_content_length)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn builder(transport: Arc<dyn Transport>) -> GatewayBuilder {
        GatewayBuilder::new(transport)
    }

    #[must_use]
    pub const fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Number of `fetch` calls that have not settled yet.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Abort every in-flight call, reject every queued caller and fail every
    /// later `fetch`. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.admission.dispose();
        let mut aborted = 0_usize;
        for entry in self.pending.iter() {
            entry.value().abort(AbortReason::Disposed);
            aborted += 1;
        }
        info!(target: TRACE_TARGET_FETCH, aborted, "gateway disposed");
    }

    /// Issue one request through admission control and destination policy.
    ///
    /// # Errors
    /// See [`ErrorKind`](crate::ErrorKind) for the failure classes.
    pub async fn fetch(&self, url: &str, params: FetchParams) -> Result<FetchResult> {
        let span = info_span!(
            target: TRACE_TARGET_FETCH,
            "egress.fetch",
            otel.kind = "client",
            { trace::HTTP_REQUEST_METHOD } = params.method.as_str(),
            { trace::URL_FULL } = url,
            { trace::SERVER_ADDRESS } = Empty,
            { trace::HTTP_RESPONSE_STATUS_CODE } = Empty,
            { trace::OTEL_STATUS_CODE } = Empty,
        );
        let result = self.run(url, params).instrument(span.clone()).await;
        match &result {
            Ok(_) => {
                span.record(trace::OTEL_STATUS_CODE, "OK");
            }
            Err(err) => {
                span.record(trace::OTEL_STATUS_CODE, "ERROR");
                debug!(parent: &span, error = %err, kind = ?err.kind(), "fetch failed");
            }
        }
        result
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn register(&self) -> PendingRequest<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let controller = Arc::new(AbortController::new());
        self.pending.insert(id, Arc::clone(&controller));
        PendingRequest {
            registry: &self.pending,
            id,
            controller,
        }
    }

    async fn run(&self, url: &str, params: FetchParams) -> Result<FetchResult> {
        self.ensure_live()?;
        let pending = self.register();
        let _permit = self.admission.acquire().await?;
        self.ensure_live()?;

        let signal = pending.signal();
        tokio::select! {
            biased;
            reason = signal.aborted() => Err(Error::Aborted(reason)),
            result = self.execute(url, params, &pending) => result,
        }
    }

    async fn execute(
        &self,
        raw_url: &str,
        params: FetchParams,
        pending: &PendingRequest<'_>,
    ) -> Result<FetchResult> {
        let url = http_url(Url::parse(raw_url)?)?;
        if let Some(host) = url.host_str() {
            Span::current().record(trace::SERVER_ADDRESS, host);
        }
        let resolved = self.vet(&url).await?;

        let FetchParams {
            response_type,
            method,
            headers,
            body,
            redirect,
            credentials,
            mode,
            referrer,
            referrer_policy,
            timeout,
        } = params;
        let (headers, body) = outgoing(headers, body)?;
        let hop = Hop {
            method,
            url,
            headers,
            body,
            resolved,
        };
        let options = HopOptions {
            redirect,
            credentials,
            mode,
            referrer,
            referrer_policy,
        };

        let exchange = self.exchange(hop, &options, pending);
        let exchanged = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_elapsed| {
                    Err(Error::Aborted(pending.controller.abort(AbortReason::Timeout)))
                }),
            None => exchange.await,
        };
        let (
            TransportResponse {
                url,
                status,
                status_text,
                headers,
                redirected,
                body,
            },
            followed,
        ) = exchanged?;

        self.ensure_live()?;
        Span::current().record(trace::HTTP_RESPONSE_STATUS_CODE, status.as_u16());

        response::check_content_length(&headers, self.max_content_length)?;
        let (response_type, body) = response::shape(response_type, &headers, body).await?;

        Ok(FetchResult {
            url,
            ok: status.is_success(),
            response_type,
            status,
            status_text: status_text
                .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string()),
            redirected: redirected || followed,
            headers,
            body,
        })
    }

    async fn vet(&self, url: &Url) -> Result<Vec<IpAddr>> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl("missing host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidUrl("missing port".to_string()))?;
        self.policy
            .vet_host(host, port)
            .await
            .map_err(|reason| Error::AddressBlocked {
                host: host.to_string(),
                reason,
            })
    }

    /// Send `hop`, following redirects under [`RedirectPolicy::Follow`]. Every
    /// redirect target passes destination policy before it is contacted.
    /// Returns the final response and whether a redirect was followed.
    async fn exchange(
        &self,
        mut hop: Hop,
        options: &HopOptions,
        pending: &PendingRequest<'_>,
    ) -> Result<(TransportResponse, bool)> {
        let follow = options.redirect == RedirectPolicy::Follow;
        let mut followed = 0;
        loop {
            let mut headers = hop.headers.clone();
            if let Some(static_headers) = &self.static_headers {
                merge_headers(&mut headers, &static_headers.for_url(&hop.url));
            }
            let request = TransportRequest {
                method: hop.method.clone(),
                url: hop.url.clone(),
                headers,
                body: hop.body.clone(),
                redirect: if follow {
                    RedirectPolicy::Manual
                } else {
                    options.redirect
                },
                credentials: options.credentials,
                mode: options.mode,
                referrer: options.referrer.clone(),
                referrer_policy: options.referrer_policy.clone(),
                max_content_length: self.max_content_length,
                resolved: core::mem::take(&mut hop.resolved),
            };

            let response = self
                .transport
                .send(request, pending.signal())
                .await
                .map_err(|err| {
                    pending
                        .controller
                        .reason()
                        .map_or_else(|| Error::Transport(err), Error::Aborted)
                })?;

            let Some(location) = follow.then(|| redirect_location(&response)).flatten() else {
                return Ok((response, followed > 0));
            };
            if followed == MAX_REDIRECTS {
                return Err(Error::Transport(Box::new(TooManyRedirects(MAX_REDIRECTS))));
            }
            followed += 1;

            let next = http_url(response.url.join(location)?)?;
            debug!(
                target: TRACE_TARGET_FETCH,
                status = response.status.as_u16(),
                location = %next,
                "following redirect"
            );
            hop.redirect_to(response.status, next);
            hop.resolved = self.vet(&hop.url).await?;
        }
    }
}

const MAX_REDIRECTS: usize = 20;

#[derive(Debug, thiserror::Error)]
#[error("more than {0} redirects")]
struct TooManyRedirects(usize);

/// Per-call options that stay fixed across redirects.
struct HopOptions {
    redirect: RedirectPolicy,
    credentials: CredentialsPolicy,
    mode: RequestMode,
    referrer: Option<String>,
    referrer_policy: Option<String>,
}

/// One request of a redirect chain.
struct Hop {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    resolved: Vec<IpAddr>,
}

impl Hop {
    fn redirect_to(&mut self, status: StatusCode, next: Url) {
        let to_get = (status == StatusCode::SEE_OTHER && self.method != Method::HEAD)
            || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                && self.method == Method::POST);
        if to_get {
            self.method = Method::GET;
            self.body = None;
            self.headers.remove(CONTENT_TYPE);
            self.headers.remove(CONTENT_LENGTH);
        }
        if next.origin() != self.url.origin() {
            self.headers.remove(AUTHORIZATION);
            self.headers.remove(COOKIE);
        }
        self.url = next;
    }
}

fn http_url(url: Url) -> Result<Url> {
    if matches!(url.scheme(), "http" | "https") {
        Ok(url)
    } else {
        Err(Error::InvalidUrl(format!(
            "unsupported scheme: {}",
            url.scheme()
        )))
    }
}

fn redirect_location(response: &TransportResponse) -> Option<&str> {
    matches!(
        response.status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
    .then(|| response.headers.get(LOCATION)?.to_str().ok())
    .flatten()
}

/// Build the caller's outgoing headers and body. The caller's `Host` is
/// dropped and text bodies get a default content type.
fn outgoing(
    mut headers: HeaderMap,
    body: Option<RequestBody>,
) -> Result<(HeaderMap, Option<Bytes>)> {
    headers.remove(HOST);
    let body = match body {
        None => None,
        Some(RequestBody::Text(text)) => {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(DEFAULT_TEXT_CONTENT_TYPE),
                );
            }
            Some(Bytes::from(text))
        }
        Some(RequestBody::Bytes(bytes)) => Some(bytes),
        Some(RequestBody::Form(entries)) => {
            let encoded = form::encode_multipart(&entries);
            let content_type = HeaderValue::from_str(&encoded.content_type)
                .map_err(|e| Error::InvalidRequest(e.to_string()))?;
            headers.insert(CONTENT_TYPE, content_type);
            Some(encoded.body)
        }
    };
    Ok((headers, body))
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.dispose();
    }
}
