//! Async DNS capability consumed by filters: submit a query, get a result
//! later. Thin wrapper so the rest of the core never touches resolver
//! internals.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Resolver {
            inner: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        })
    }

    pub async fn lookup_ips(&self, name: &str) -> Vec<IpAddr> {
        match self.inner.lookup_ip(name).await {
            Ok(lookup) => lookup.iter().collect(),
            Err(e) => {
                log::debug!("lookup {name} failed: {e}");
                Vec::new()
            }
        }
    }

    /// DNSBL-style membership check: `<host>.<zone>` resolving at all means
    /// the host is listed.
    pub async fn host_listed(&self, host: &str, zone: &str) -> bool {
        let query = format!("{host}.{zone}.");
        !self.lookup_ips(&query).await.is_empty()
    }
}
