use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::CatalogError;

/// Resolves catalog hostnames to IP addresses.
///
/// Envoy can't resolve names handed to it over EDS, so any catalog address
/// that isn't already an IP gets resolved here before it becomes an
/// endpoint.
#[async_trait]
pub trait DnsResolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, CatalogError>;
}

/// A resolver that uses the system's resolver through `getaddrinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, CatalogError> {
        // lookup_host needs a port. it's discarded immediately.
        let addrs = tokio::net::lookup_host((host, 80))
            .await
            .map_err(|e| CatalogError::Dns {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// Resolve an address that may already be an IP. IP addresses are returned
/// as-is and never touch the resolver.
pub(crate) async fn resolve_address(
    resolver: Option<&dyn DnsResolver>,
    address: &str,
) -> Result<Vec<IpAddr>, CatalogError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    match resolver {
        Some(resolver) => resolver.resolve(address).await,
        None => {
            tracing::warn!(
                %address,
                "catalog returned a hostname but no DNS resolver is configured, skipping",
            );
            Ok(Vec::new())
        }
    }
}
