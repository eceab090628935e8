use super::{Resolver, TokioResolver, ranges::private_networks};
use ipnet::IpNet;
use regex::Regex;
use std::{net::IpAddr, str::FromStr, sync::Arc, time::Duration};
use tracing::warn;

/// Why a destination was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockReason {
    #[error("direct ip access is not allowed")]
    DirectIpDenied,
    #[error("domain matches deny pattern {0}")]
    DomainDenied(String),
    #[error("domain matches no allow pattern")]
    DomainNotAllowed,
    #[error("destination ip {0} is denied")]
    IpDenied(IpAddr),
    #[error("destination ip {0} is not in the allow list")]
    IpNotAllowed(IpAddr),
    #[error("dns error: {0}")]
    Resolution(String),
    #[error("dns timeout")]
    ResolutionTimeout,
    #[error("hostname resolved to no addresses")]
    NoAddresses,
}

/// A domain allow/deny entry.
///
/// Parsing from a string treats `/expr/` as a regular expression and anything
/// else as an exact hostname.
#[derive(Debug, Clone)]
pub enum DomainPattern {
    /// Pre-normalized: trimmed of trailing dots and lowercased.
    Exact(String),
    Regex(Regex),
}

impl DomainPattern {
    #[must_use]
    pub fn exact(host: impl Into<String>) -> Self {
        Self::Exact(normalize_host(&host.into()))
    }

    /// # Errors
    /// Returns an error if `expr` is not a valid regular expression.
    pub fn regex(expr: &str) -> Result<Self, regex::Error> {
        Regex::new(expr).map(Self::Regex)
    }

    /// `host` must already be normalized.
    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(expected) => host == expected,
            Self::Regex(re) => re.is_match(host),
        }
    }
}

impl core::fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Exact(host) => f.write_str(host),
            Self::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

impl FromStr for DomainPattern {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(expr) => Self::regex(expr),
            None => Ok(Self::exact(s)),
        }
    }
}

impl From<Regex> for DomainPattern {
    fn from(re: Regex) -> Self {
        Self::Regex(re)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Parse a URL host component into a literal address, if it is one.
fn ip_literal(host: &str) -> Option<IpAddr> {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    bare.parse().ok()
}

/// Destination policy: domain patterns, CIDR masks and resolution of every
/// hostname to its addresses. Deny lists always win over allow lists.
#[derive(Clone)]
pub struct AddressPolicy {
    allow_direct_ip: bool,
    ip_allow: Arc<Vec<IpNet>>,
    ip_deny: Arc<Vec<IpNet>>,
    domain_allow: Arc<Vec<DomainPattern>>,
    domain_deny: Arc<Vec<DomainPattern>>,
    resolver: Arc<dyn Resolver>,
    dns_timeout: Duration,
}

impl core::fmt::Debug for AddressPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressPolicy")
            .field("allow_direct_ip", &self.allow_direct_ip)
            .field("ip_allow", &self.ip_allow)
            .field("ip_deny", &self.ip_deny)
            .field("domain_allow", &self.domain_allow)
            .field("domain_deny", &self.domain_deny)
            .field("dns_timeout", &self.dns_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for AddressPolicy {
    fn default() -> Self {
        AddressPolicyBuilder::new().build()
    }
}

pub struct AddressPolicyBuilder {
    allow_direct_ip: bool,
    ip_allow: Vec<IpNet>,
    ip_deny: Vec<IpNet>,
    domain_allow: Vec<DomainPattern>,
    domain_deny: Vec<DomainPattern>,
    resolver: Arc<dyn Resolver>,
    dns_timeout: Duration,
}

impl Default for AddressPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressPolicyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            allow_direct_ip: false,
            ip_allow: Vec::new(),
            ip_deny: Vec::new(),
            domain_allow: Vec::new(),
            domain_deny: Vec::new(),
            resolver: Arc::new(TokioResolver),
            dns_timeout: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub const fn allow_direct_ip(mut self, allow: bool) -> Self {
        self.allow_direct_ip = allow;
        self
    }

    #[must_use]
    pub fn ip_allow(mut self, nets: impl IntoIterator<Item = IpNet>) -> Self {
        self.ip_allow.extend(nets);
        self
    }

    #[must_use]
    pub fn ip_deny(mut self, nets: impl IntoIterator<Item = IpNet>) -> Self {
        self.ip_deny.extend(nets);
        self
    }

    /// Add loopback, private, link-local and multicast ranges to the deny list.
    #[must_use]
    pub fn deny_private_ranges(self) -> Self {
        self.ip_deny(private_networks().iter().copied())
    }

    #[must_use]
    pub fn domain_allow(mut self, patterns: impl IntoIterator<Item = DomainPattern>) -> Self {
        self.domain_allow.extend(patterns);
        self
    }

    #[must_use]
    pub fn domain_deny(mut self, patterns: impl IntoIterator<Item = DomainPattern>) -> Self {
        self.domain_deny.extend(patterns);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub const fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> AddressPolicy {
        AddressPolicy {
            allow_direct_ip: self.allow_direct_ip,
            ip_allow: Arc::new(self.ip_allow),
            ip_deny: Arc::new(self.ip_deny),
            domain_allow: Arc::new(self.domain_allow),
            domain_deny: Arc::new(self.domain_deny),
            resolver: self.resolver,
            dns_timeout: self.dns_timeout,
        }
    }
}

impl AddressPolicy {
    #[must_use]
    pub fn builder() -> AddressPolicyBuilder {
        AddressPolicyBuilder::new()
    }

    /// Check a single address against the CIDR masks.
    ///
    /// # Errors
    /// Returns the reason the address is refused.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), BlockReason> {
        // An IPv4-mapped IPv6 address is also checked in its IPv4 form.
        let canonical = ip.to_canonical();
        let contains = |net: &IpNet| net.contains(&ip) || net.contains(&canonical);

        if self.ip_deny.iter().any(contains) {
            return Err(BlockReason::IpDenied(ip));
        }
        if !self.ip_allow.is_empty() && !self.ip_allow.iter().any(contains) {
            return Err(BlockReason::IpNotAllowed(ip));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_ip_allowed(&self, ip: IpAddr) -> bool {
        self.check_ip(ip).is_ok()
    }

    /// Check domain patterns only, without resolving.
    ///
    /// # Errors
    /// Returns the reason the hostname is refused.
    pub fn check_domain(&self, host: &str) -> Result<(), BlockReason> {
        let host = normalize_host(host);
        if let Some(pattern) = self.domain_deny.iter().find(|p| p.matches(&host)) {
            return Err(BlockReason::DomainDenied(pattern.to_string()));
        }
        if !self.domain_allow.is_empty() && !self.domain_allow.iter().any(|p| p.matches(&host)) {
            return Err(BlockReason::DomainNotAllowed);
        }
        Ok(())
    }

    /// Decide whether `host` may be contacted on `port`.
    ///
    /// Literal addresses need `allow_direct_ip`; names must pass the domain
    /// patterns and every address they resolve to must pass the CIDR masks.
    ///
    /// # Errors
    /// Returns the reason the destination is refused. Resolution failures are
    /// refusals.
    pub async fn check_host(&self, host: &str, port: u16) -> Result<(), BlockReason> {
        self.vet_host(host, port).await.map(drop)
    }

    /// Like [`check_host`](Self::check_host), returning the addresses that
    /// passed. Connections should go only to these.
    ///
    /// # Errors
    /// Returns the reason the destination is refused.
    pub async fn vet_host(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, BlockReason> {
        let result = self.evaluate(host, port).await;
        if let Err(reason) = &result {
            warn!(host, port, %reason, "destination blocked");
        }
        result
    }

    pub async fn is_hostname_allowed(&self, host: &str) -> bool {
        self.check_host(host, 0).await.is_ok()
    }

    /// The checks that need no resolution: the literal-address rule, CIDR
    /// masks for literals and domain patterns for names.
    ///
    /// # Errors
    /// Returns the reason the host is refused.
    pub fn precheck_host(&self, host: &str) -> Result<Option<IpAddr>, BlockReason> {
        if let Some(ip) = ip_literal(host) {
            if !self.allow_direct_ip {
                return Err(BlockReason::DirectIpDenied);
            }
            return self.check_ip(ip).map(|()| Some(ip));
        }
        self.check_domain(host).map(|()| None)
    }

    async fn evaluate(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, BlockReason> {
        if let Some(ip) = self.precheck_host(host)? {
            return Ok(vec![ip]);
        }

        let addrs = tokio::time::timeout(self.dns_timeout, self.resolver.resolve(host, port))
            .await
            .map_err(|_e| BlockReason::ResolutionTimeout)?
            .map_err(|e| BlockReason::Resolution(e.to_string()))?;

        if addrs.is_empty() {
            return Err(BlockReason::NoAddresses);
        }
        for &ip in &addrs {
            self.check_ip(ip)?;
        }
        Ok(addrs)
    }
}
