use std::{future::Future, io, net::IpAddr, pin::Pin, sync::Arc};

#[async_trait::async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

#[async_trait::async_trait]
impl<T: Resolver + ?Sized> Resolver for Arc<T> {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        (**self).resolve(host, port).await
    }
}

/// System resolver via [`tokio::net::lookup_host`]. Returns each address
/// once, in sorted order.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioResolver;

#[async_trait::async_trait]
impl Resolver for TokioResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let mut ips: Vec<IpAddr> = tokio::net::lookup_host((host, port))
            .await?
            .map(|addr| addr.ip())
            .collect();
        ips.sort_unstable();
        ips.dedup();
        Ok(ips)
    }
}

type ResolveFuture = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send>>;

struct FnResolver<F>(F);

#[async_trait::async_trait]
impl<F> Resolver for FnResolver<F>
where
    F: Fn(String, u16) -> ResolveFuture + Send + Sync + 'static,
{
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        (self.0)(host.to_string(), port).await
    }
}

/// Adapt an async closure into a [`Resolver`].
///
/// ```
/// let resolver = egress::net::resolver_fn(|_host, _port| async {
///     Ok(vec!["93.184.216.34".parse().unwrap()])
/// });
/// # let _ = resolver;
/// ```
pub fn resolver_fn<F, Fut>(f: F) -> Arc<dyn Resolver>
where
    F: Fn(String, u16) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<Vec<IpAddr>>> + Send + 'static,
{
    Arc::new(FnResolver(move |host, port| -> ResolveFuture {
        Box::pin(f(host, port))
    }))
}
