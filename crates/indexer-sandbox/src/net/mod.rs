//! Outbound network access for the `http`, `https`, `net` and `tls`
//! capabilities.
//!
//! Every request and socket is checked against the [`NetworkPolicy`] of the
//! runtime's [`SecurityPolicy`](crate::SecurityPolicy) before anything leaves
//! the host.

mod acl;
mod dns;
mod private_ranges;

use http::Method;
use url::Url;

pub use acl::{AclPolicy, AclPolicyBuilder};
pub use acl::{
    Action as AclAction, HostMatch as AclHostMatch, PortRange as AclPortRange, Rule as AclRule,
    Scheme as AclScheme,
};
pub use dns::{DnsResolver, TokioDnsResolver};
pub use private_ranges::is_private_ip;

#[derive(Debug, Clone)]
pub struct HttpMeta {
    pub method: Method,
    pub url: Url,
}

/// A raw stream connection, optionally wrapped in TLS.
#[derive(Debug, Clone)]
pub struct SocketMeta {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

#[async_trait::async_trait]
pub trait NetworkPolicy: Send + Sync + core::fmt::Debug + 'static {
    async fn check_http(&self, meta: &HttpMeta) -> core::result::Result<(), String>;
    async fn check_socket(&self, meta: &SocketMeta) -> core::result::Result<(), String>;
}

/// Lets everything through. The default, so whitelisted network capabilities
/// behave as they do in Node.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait::async_trait]
impl NetworkPolicy for AllowAllPolicy {
    async fn check_http(&self, _meta: &HttpMeta) -> core::result::Result<(), String> {
        Ok(())
    }

    async fn check_socket(&self, _meta: &SocketMeta) -> core::result::Result<(), String> {
        Ok(())
    }
}
