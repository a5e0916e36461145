use std::{net::IpAddr, sync::Arc, time::Duration};

use http::Method;

use super::{
    DnsResolver, HttpMeta, NetworkPolicy, SocketMeta, TokioDnsResolver, is_private_ip,
};

/// What kind of connection a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    /// `net.connect`
    Tcp,
    /// `tls.connect`
    Tls,
}

impl Scheme {
    fn from_url(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum HostMatch {
    /// Stored without trailing dots, lowercased.
    Exact(String),
    /// Stored without leading or trailing dots, lowercased.
    Suffix(String),
}

impl HostMatch {
    fn new_exact(host: impl Into<String>) -> Self {
        Self::Exact(host.into().trim_end_matches('.').to_ascii_lowercase())
    }

    fn new_suffix(suffix: impl Into<String>) -> Self {
        Self::Suffix(
            suffix
                .into()
                .trim_start_matches('.')
                .trim_end_matches('.')
                .to_ascii_lowercase(),
        )
    }

    fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        match self {
            Self::Exact(expected) => host == *expected,
            Self::Suffix(bare) => {
                host == *bare
                    || host
                        .strip_suffix(bare.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    #[must_use]
    pub const fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    const fn contains(self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

/// One ACL entry. Empty criteria match anything; a rule with methods never
/// matches a socket.
#[derive(Debug, Clone)]
pub struct Rule {
    action: Action,
    schemes: Vec<Scheme>,
    methods: Vec<Method>,
    host: Option<HostMatch>,
    ports: Vec<PortRange>,
}

impl Rule {
    #[must_use]
    pub const fn allow() -> Self {
        Self::new(Action::Allow)
    }

    #[must_use]
    pub const fn deny() -> Self {
        Self::new(Action::Deny)
    }

    const fn new(action: Action) -> Self {
        Self {
            action,
            schemes: Vec::new(),
            methods: Vec::new(),
            host: None,
            ports: Vec::new(),
        }
    }

    #[must_use]
    pub fn schemes(mut self, schemes: impl IntoIterator<Item = Scheme>) -> Self {
        self.schemes = schemes.into_iter().collect();
        self
    }

    #[must_use]
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    #[must_use]
    pub fn host_exact(mut self, host: impl Into<String>) -> Self {
        self.host = Some(HostMatch::new_exact(host));
        self
    }

    #[must_use]
    pub fn host_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.host = Some(HostMatch::new_suffix(suffix));
        self
    }

    #[must_use]
    pub fn ports(mut self, ports: impl IntoIterator<Item = PortRange>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    fn matches(&self, target: &Target<'_>) -> bool {
        if !self.schemes.is_empty() && !self.schemes.contains(&target.scheme) {
            return false;
        }
        if !self.methods.is_empty()
            && !target
                .method
                .is_some_and(|method| self.methods.contains(method))
        {
            return false;
        }
        if let Some(host) = &self.host
            && !host.matches(target.host)
        {
            return false;
        }
        self.ports.is_empty() || self.ports.iter().any(|range| range.contains(target.port))
    }
}

struct Target<'a> {
    scheme: Scheme,
    host: &'a str,
    port: u16,
    method: Option<&'a Method>,
}

/// First-match allow/deny list, with destinations in private address ranges
/// refused up front unless disabled.
#[derive(Clone)]
pub struct AclPolicy {
    rules: Arc<Vec<Rule>>,
    deny_private_ranges: bool,
    resolver: Arc<dyn DnsResolver>,
    dns_timeout: Duration,
    dns_max_addrs: usize,
}

impl core::fmt::Debug for AclPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AclPolicy")
            .field("rules", &self.rules)
            .field("deny_private_ranges", &self.deny_private_ranges)
            .field("dns_timeout", &self.dns_timeout)
            .field("dns_max_addrs", &self.dns_max_addrs)
            .finish_non_exhaustive()
    }
}

pub struct AclPolicyBuilder {
    rules: Vec<Rule>,
    deny_private_ranges: bool,
    resolver: Arc<dyn DnsResolver>,
    dns_timeout: Duration,
    dns_max_addrs: usize,
}

impl Default for AclPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AclPolicyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            deny_private_ranges: true,
            resolver: Arc::new(TokioDnsResolver),
            dns_timeout: Duration::from_secs(1),
            dns_max_addrs: 16,
        }
    }

    #[must_use]
    pub fn push(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub const fn deny_private_ranges(mut self, deny: bool) -> Self {
        self.deny_private_ranges = deny;
        self
    }

    #[must_use]
    pub const fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn dns_max_addrs(mut self, max: usize) -> Self {
        self.dns_max_addrs = max;
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn build(self) -> AclPolicy {
        AclPolicy {
            rules: Arc::new(self.rules),
            deny_private_ranges: self.deny_private_ranges,
            resolver: self.resolver,
            dns_timeout: self.dns_timeout,
            dns_max_addrs: self.dns_max_addrs,
        }
    }
}

impl AclPolicy {
    #[must_use]
    pub fn builder() -> AclPolicyBuilder {
        AclPolicyBuilder::new()
    }

    async fn check_private(&self, host: &str, port: u16) -> Result<(), String> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_ip(ip) {
                return Err(format!("destination ip prohibited: {ip}"));
            }
            return Ok(());
        }

        let addrs = tokio::time::timeout(self.dns_timeout, self.resolver.resolve(host, port))
            .await
            .map_err(|_| "dns timeout".to_string())?
            .map_err(|e| format!("dns error: {e}"))?;
        for ip in addrs.into_iter().take(self.dns_max_addrs) {
            if is_private_ip(ip) {
                return Err(format!("destination ip prohibited: {ip}"));
            }
        }
        Ok(())
    }

    async fn check(&self, target: Target<'_>) -> Result<(), String> {
        if self.deny_private_ranges {
            self.check_private(target.host, target.port).await?;
        }
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.matches(&target) {
                return match rule.action {
                    Action::Allow => Ok(()),
                    Action::Deny => Err(format!("denied by rule #{idx}")),
                };
            }
        }
        Err("no ACL rule matched".to_string())
    }
}

#[async_trait::async_trait]
impl NetworkPolicy for AclPolicy {
    async fn check_http(&self, meta: &HttpMeta) -> core::result::Result<(), String> {
        let scheme =
            Scheme::from_url(meta.url.scheme()).ok_or_else(|| "unsupported scheme".to_string())?;
        let host = meta
            .url
            .host_str()
            .ok_or_else(|| "missing host".to_string())?;
        let port = meta
            .url
            .port_or_known_default()
            .ok_or_else(|| "missing port".to_string())?;
        self.check(Target {
            scheme,
            host,
            port,
            method: Some(&meta.method),
        })
        .await
    }

    async fn check_socket(&self, meta: &SocketMeta) -> core::result::Result<(), String> {
        self.check(Target {
            scheme: if meta.tls { Scheme::Tls } else { Scheme::Tcp },
            host: &meta.host,
            port: meta.port,
            method: None,
        })
        .await
    }
}
