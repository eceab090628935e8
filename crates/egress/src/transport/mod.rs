#[cfg(feature = "reqwest")]
mod reqwest;

use std::{future::Future, net::IpAddr, pin::Pin, sync::Arc};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

use crate::{
    abort::AbortSignal,
    error::BoxError,
    request::{CredentialsPolicy, RedirectPolicy, RequestMode},
};

#[cfg(feature = "reqwest")]
pub use self::reqwest::{ReqwestTransport, ResponseTooLarge};

/// A request that passed admission and destination policy.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub redirect: RedirectPolicy,
    pub credentials: CredentialsPolicy,
    pub mode: RequestMode,
    pub referrer: Option<String>,
    pub referrer_policy: Option<String>,
    /// The gateway's response size cap, so transports can stop reading early.
    pub max_content_length: Option<u64>,
    /// Addresses of `url`'s host that passed destination policy. Transports
    /// should connect only to these.
    pub resolved: Vec<IpAddr>,
}

impl TransportRequest {
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            redirect: RedirectPolicy::default(),
            credentials: CredentialsPolicy::default(),
            mode: RequestMode::default(),
            referrer: None,
            referrer_policy: None,
            max_content_length: None,
            resolved: Vec::new(),
        }
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// Final URL after any redirects.
    pub url: Url,
    pub status: StatusCode,
    /// Reason phrase sent by the server, when the transport has it.
    pub status_text: Option<String>,
    pub headers: HeaderMap,
    pub redirected: bool,
    pub body: Bytes,
}

impl TransportResponse {
    #[must_use]
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            status_text: None,
            headers: HeaderMap::new(),
            redirected: false,
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = Some(status_text.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub const fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }
}

/// Performs the network exchange for the gateway.
///
/// Implementations own connection handling and TLS. They must not follow
/// redirects: a 3xx response is returned as is, or fails under
/// [`RedirectPolicy::Error`]. The gateway follows redirects itself so every
/// hop passes destination policy. They should stop work once `signal` fires;
/// the gateway stops waiting on them regardless.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        request: TransportRequest,
        signal: AbortSignal,
    ) -> Result<TransportResponse, BoxError>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(
        &self,
        request: TransportRequest,
        signal: AbortSignal,
    ) -> Result<TransportResponse, BoxError> {
        (**self).send(request, signal).await
    }
}

type SendFuture = Pin<Box<dyn Future<Output = Result<TransportResponse, BoxError>> + Send>>;

struct FnTransport<F>(F);

#[async_trait::async_trait]
impl<F> Transport for FnTransport<F>
where
    F: Fn(TransportRequest, AbortSignal) -> SendFuture + Send + Sync + 'static,
{
    async fn send(
        &self,
        request: TransportRequest,
        signal: AbortSignal,
    ) -> Result<TransportResponse, BoxError> {
        (self.0)(request, signal).await
    }
}

/// Adapt an async closure into a [`Transport`].
pub fn transport_fn<F, Fut>(f: F) -> Arc<dyn Transport>
where
    F: Fn(TransportRequest, AbortSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TransportResponse, BoxError>> + Send + 'static,
{
    Arc::new(FnTransport(
        move |request, signal| -> SendFuture { Box::pin(f(request, signal)) },
    ))
}
