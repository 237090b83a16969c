//! Service catalog discovery.
//!
//! Consul is the only supported catalog. Discovery runs in two directions:
//! [UpstreamDiscovery] writes an Upstream for every service in the catalog,
//! and the endpoint watcher started by the consul plugin turns the instances
//! of every watched service into Endpoints.

mod consul;
mod dns;
mod endpoints;
mod upstreams;

pub use consul::{CatalogService, ConsulCatalog, ConsulClient, Indexed, ServiceMeta};
pub use dns::{DnsResolver, SystemResolver};
pub use endpoints::{DC_LABEL_PREFIX, LABEL_MATCH, LABEL_NO_MATCH, TAG_LABEL_PREFIX};
pub use upstreams::{UpstreamDiscovery, CONSUL_UPSTREAM_PREFIX, DISCOVERED_BY_LABEL};

pub(crate) use endpoints::EndpointWatcher;

const MAX_NAME_LEN: usize = 63;

/// Turn an arbitrary string into a name that's safe to use as a DNS label.
///
/// Names longer than 63 bytes are cut to a prefix of at most 31 characters
/// and suffixed with a hash of the full name so that they stay unique. The
/// prefix always ends on a character boundary.
pub(crate) fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter_map(|c| match c {
            '*' | '/' | '.' | ':' | '_' | ' ' => Some('-'),
            '[' | ']' | '\n' | '"' | '\'' => None,
            c => Some(c),
        })
        .flat_map(char::to_lowercase)
        .collect();

    if sanitized.len() <= MAX_NAME_LEN {
        return sanitized;
    }

    let suffix = format!("-{:016x}", xxhash_rust::xxh64::xxh64(sanitized.as_bytes(), 0));
    let max_prefix = MAX_NAME_LEN - suffix.len();
    let mut prefix = String::with_capacity(MAX_NAME_LEN);
    for c in sanitized.chars().take(31) {
        if prefix.len() + c.len_utf8() > max_prefix {
            break;
        }
        prefix.push(c);
    }
    prefix.push_str(&suffix);
    prefix
}
