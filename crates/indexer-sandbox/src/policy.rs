use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::net::{AllowAllPolicy, NetworkPolicy};

/// Host facility addressable with `require(name)` from inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Assert,
    Buffer,
    Crypto,
    Util,
    Path,
    Net,
    Tls,
    Fs,
    Dns,
    StringDecoder,
    Vm,
    Punycode,
    Url,
    Stream,
    Http,
    Https,
    Zlib,
    Querystring,
    Os,
    ChildProcess,
    Events,
    Process,
}

impl Capability {
    /// Capabilities reachable in restricted mode.
    pub const WHITELIST: [Self; 20] = [
        Self::Assert,
        Self::Buffer,
        Self::Crypto,
        Self::Util,
        Self::Path,
        Self::Net,
        Self::Tls,
        Self::Fs,
        Self::Dns,
        Self::StringDecoder,
        Self::Vm,
        Self::Punycode,
        Self::Url,
        Self::Stream,
        Self::Http,
        Self::Https,
        Self::Zlib,
        Self::Querystring,
        Self::Os,
        Self::ChildProcess,
    ];

    /// Capabilities reachable only when the policy is unrestricted.
    pub const PRIVILEGED: [Self; 2] = [Self::Events, Self::Process];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Assert => "assert",
            Self::Buffer => "buffer",
            Self::Crypto => "crypto",
            Self::Util => "util",
            Self::Path => "path",
            Self::Net => "net",
            Self::Tls => "tls",
            Self::Fs => "fs",
            Self::Dns => "dns",
            Self::StringDecoder => "string_decoder",
            Self::Vm => "vm",
            Self::Punycode => "punycode",
            Self::Url => "url",
            Self::Stream => "stream",
            Self::Http => "http",
            Self::Https => "https",
            Self::Zlib => "zlib",
            Self::Querystring => "querystring",
            Self::Os => "os",
            Self::ChildProcess => "child_process",
            Self::Events => "events",
            Self::Process => "process",
        }
    }

    /// Looks up a capability by module name. A `node:` prefix is accepted.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix("node:").unwrap_or(name);
        Self::all().find(|capability| capability.name() == name)
    }

    pub fn all() -> impl Iterator<Item = Self> {
        Self::WHITELIST.into_iter().chain(Self::PRIVILEGED)
    }

    #[must_use]
    pub const fn is_whitelisted(self) -> bool {
        !matches!(self, Self::Events | Self::Process)
    }
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the sandbox's `console` output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Emit `tracing` events under [`TRACE_TARGET_CONSOLE`](crate::TRACE_TARGET_CONSOLE).
    #[default]
    Redirect,
    /// Write to the host process's stdout/stderr.
    Inherit,
    Off,
}

/// Immutable description of what sandboxed code may reach.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    allowed: BTreeSet<Capability>,
    unrestricted: bool,
    output: OutputMode,
    env: BTreeMap<String, String>,
    max_memory: usize,
    max_stack_size: usize,
    network: Arc<dyn NetworkPolicy>,
}

impl SecurityPolicy {
    pub const DEFAULT_MAX_MEMORY: usize = 64 * 1024 * 1024;
    pub const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024;

    /// The whitelist, nothing else.
    #[must_use]
    pub fn restricted() -> Self {
        Self::builder().build()
    }

    /// Every capability, including the privileged ones.
    #[must_use]
    pub fn unrestricted() -> Self {
        Self::builder().unrestricted(true).build()
    }

    #[must_use]
    pub fn builder() -> SecurityPolicyBuilder {
        SecurityPolicyBuilder::new()
    }

    #[must_use]
    pub fn allows(&self, capability: Capability) -> bool {
        self.unrestricted || self.allowed.contains(&capability)
    }

    #[must_use]
    pub const fn is_unrestricted(&self) -> bool {
        self.unrestricted
    }

    #[must_use]
    pub const fn output(&self) -> OutputMode {
        self.output
    }

    /// Environment explicitly passed to sandboxed code (`process.env` and
    /// child processes). The host environment is never inherited.
    #[must_use]
    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub const fn max_memory(&self) -> usize {
        self.max_memory
    }

    #[must_use]
    pub const fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    /// Gate for outbound requests and sockets, consulted even in
    /// unrestricted mode.
    #[must_use]
    pub fn network(&self) -> &Arc<dyn NetworkPolicy> {
        &self.network
    }

    /// Effective set of reachable capabilities.
    pub fn allowed(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::all().filter(|capability| self.allows(*capability))
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::restricted()
    }
}

pub struct SecurityPolicyBuilder {
    allowed: BTreeSet<Capability>,
    unrestricted: bool,
    output: OutputMode,
    env: BTreeMap<String, String>,
    max_memory: usize,
    max_stack_size: usize,
    network: Arc<dyn NetworkPolicy>,
}

impl Default for SecurityPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityPolicyBuilder {
    /// Starts from the whitelist.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allowed: Capability::WHITELIST.into_iter().collect(),
            unrestricted: false,
            output: OutputMode::default(),
            env: BTreeMap::new(),
            max_memory: SecurityPolicy::DEFAULT_MAX_MEMORY,
            max_stack_size: SecurityPolicy::DEFAULT_MAX_STACK_SIZE,
            network: Arc::new(AllowAllPolicy),
        }
    }

    #[must_use]
    pub fn allow(mut self, capability: Capability) -> Self {
        self.allowed.insert(capability);
        self
    }

    #[must_use]
    pub fn deny(mut self, capability: Capability) -> Self {
        self.allowed.remove(&capability);
        self
    }

    /// Replaces the allow-set.
    #[must_use]
    pub fn allow_only(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.allowed = capabilities.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn unrestricted(mut self, unrestricted: bool) -> Self {
        self.unrestricted = unrestricted;
        self
    }

    #[must_use]
    pub const fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn envs<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub const fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    #[must_use]
    pub const fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    /// Replaces the default [`AllowAllPolicy`].
    #[must_use]
    pub fn network(mut self, policy: impl NetworkPolicy) -> Self {
        self.network = Arc::new(policy);
        self
    }

    /// Like [`network`](Self::network), sharing an existing policy.
    #[must_use]
    pub fn network_arc(mut self, policy: Arc<dyn NetworkPolicy>) -> Self {
        self.network = policy;
        self
    }

    #[must_use]
    pub fn build(self) -> SecurityPolicy {
        SecurityPolicy {
            allowed: self.allowed,
            unrestricted: self.unrestricted,
            output: self.output,
            env: self.env,
            max_memory: self.max_memory,
            max_stack_size: self.max_stack_size,
            network: self.network,
        }
    }
}
