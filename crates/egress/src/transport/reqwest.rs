use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use bytes::BytesMut;
use dashmap::{DashMap, mapref::entry::Entry};
use http::{
    HeaderValue,
    header::{AUTHORIZATION, COOKIE, HOST, REFERER},
};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use super::{Transport, TransportRequest, TransportResponse};
use crate::{
    abort::{AbortReason, AbortSignal},
    error::BoxError,
    request::{CredentialsPolicy, RedirectPolicy},
};

const USER_AGENT: &str = "Egress/1.0";

/// The body grew past the gateway's content-length cap while streaming.
#[derive(Debug, thiserror::Error)]
#[error("response body exceeds {max} bytes")]
pub struct ResponseTooLarge {
    pub max: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("redirect refused: {status} from {url}")]
struct RedirectRefused {
    status: http::StatusCode,
    url: url::Url,
}

#[derive(Debug, thiserror::Error)]
#[error("request aborted: {0}")]
struct Aborted(AbortReason);

#[derive(Debug, thiserror::Error)]
#[error("no vetted addresses for {0}")]
struct Unvetted(String);

fn host_key(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug)]
struct VettedHost {
    addrs: Arc<[IpAddr]>,
    users: usize,
}

type VettedHosts = DashMap<String, VettedHost>;

/// Resolves a name only to the addresses vetted for the requests currently
/// in flight to it.
#[derive(Debug, Clone)]
struct PinnedResolver(Arc<VettedHosts>);

impl Resolve for PinnedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let addrs = self
            .0
            .get(&host_key(name.as_str()))
            .map(|entry| Arc::clone(&entry.addrs));
        Box::pin(async move {
            let addrs = addrs
                .filter(|addrs| !addrs.is_empty())
                .ok_or_else(|| Box::new(Unvetted(name.as_str().to_string())) as BoxError)?;
            // The connector replaces port 0 with the URL's port.
            let addrs: Addrs = Box::new(
                addrs
                    .to_vec()
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, 0)),
            );
            Ok(addrs)
        })
    }
}

/// Keeps a host's vetted addresses registered while a request uses them.
struct PinnedHost<'a> {
    hosts: &'a VettedHosts,
    key: String,
}

impl<'a> PinnedHost<'a> {
    fn new(hosts: &'a VettedHosts, host: &str, addrs: &[IpAddr]) -> Self {
        let key = host_key(host);
        let mut entry = hosts.entry(key.clone()).or_insert_with(|| VettedHost {
            addrs: Arc::from(Vec::new()),
            users: 0,
        });
        entry.addrs = Arc::from(addrs);
        entry.users += 1;
        Self { hosts, key }
    }
}

impl Drop for PinnedHost<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.hosts.entry(std::mem::take(&mut self.key)) {
            entry.get_mut().users -= 1;
            if entry.get().users == 0 {
                entry.remove();
            }
        }
    }
}

/// [`Transport`] backed by `reqwest`.
///
/// Redirects are never followed here; the gateway follows them hop by hop
/// and checks each destination. Host names resolve only to the addresses in
/// [`TransportRequest::resolved`], so the connection goes to an address the
/// gateway's policy accepted.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    vetted: Arc<VettedHosts>,
}

impl ReqwestTransport {
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_proxy(None)
    }

    /// Route every request through `proxy`. The proxy itself is contacted by
    /// address lookup of its own, outside the gateway's policy.
    ///
    /// # Errors
    /// Returns an error if the proxy URL is invalid or the client cannot be
    /// built.
    pub fn with_proxy(proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let vetted = Arc::new(VettedHosts::new());
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .dns_resolver(Arc::new(PinnedResolver(Arc::clone(&vetted))));
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            vetted,
        })
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        signal: AbortSignal,
    ) -> Result<TransportResponse, BoxError> {
        let TransportRequest {
            method,
            url,
            mut headers,
            body,
            redirect,
            credentials,
            referrer,
            max_content_length,
            resolved,
            ..
        } = request;

        headers.remove(HOST);
        if credentials == CredentialsPolicy::Omit {
            headers.remove(AUTHORIZATION);
            headers.remove(COOKIE);
        }
        if let Some(referrer) = referrer
            && !headers.contains_key(REFERER)
            && let Ok(value) = HeaderValue::from_str(&referrer)
        {
            headers.insert(REFERER, value);
        }

        let _pinned = url
            .host_str()
            .map(|host| PinnedHost::new(&self.vetted, host, &resolved));

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let mut response = tokio::select! {
            reason = signal.aborted() => return Err(Box::new(Aborted(reason))),
            response = builder.send() => response?,
        };

        let status = response.status();
        if redirect == RedirectPolicy::Error && status.is_redirection() {
            return Err(Box::new(RedirectRefused { status, url }));
        }
        let headers = std::mem::take(response.headers_mut());

        // A declared length over the cap is left for the gateway to reject
        // without reading the body.
        let declared_too_large = max_content_length
            .zip(response.content_length())
            .is_some_and(|(max, len)| len > max);

        let mut body = BytesMut::new();
        if !declared_too_large {
            loop {
                let chunk = tokio::select! {
                    reason = signal.aborted() => return Err(Box::new(Aborted(reason))),
                    chunk = response.chunk() => chunk?,
                };
                let Some(chunk) = chunk else {
                    break;
                };
                if let Some(max) = max_content_length
                    && (body.len() + chunk.len()) as u64 > max
                {
                    return Err(Box::new(ResponseTooLarge { max }));
                }
                body.extend_from_slice(&chunk);
            }
        }

        Ok(TransportResponse {
            url,
            status,
            status_text: None,
            headers,
            redirected: false,
            body: body.freeze(),
        })
    }
}
