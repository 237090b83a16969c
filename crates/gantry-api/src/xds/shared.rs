use crate::shared::{Duration, Regex};
use xds_api::pb::envoy::{
    config::core::v3 as xds_core,
    r#type::matcher::v3::{string_matcher::MatchPattern, RegexMatcher, StringMatcher},
};
use xds_api::pb::google::protobuf;

/// A ConfigSource that points at the ADS stream a proxy is already using.
pub fn ads_config_source() -> xds_core::ConfigSource {
    xds_core::ConfigSource {
        config_source_specifier: Some(xds_core::config_source::ConfigSourceSpecifier::Ads(
            xds_core::AggregatedConfigSource {},
        )),
        resource_api_version: xds_core::ApiVersion::V3 as i32,
        ..Default::default()
    }
}

pub fn regex_matcher(regex: &Regex) -> RegexMatcher {
    RegexMatcher {
        regex: regex.to_string(),
        engine_type: None,
    }
}

pub fn exact_string_matcher(value: &str) -> StringMatcher {
    StringMatcher {
        match_pattern: Some(MatchPattern::Exact(value.to_string())),
        ignore_case: false,
    }
}

pub fn socket_address(address: &str, port: u32) -> xds_core::Address {
    let socket_address = xds_core::SocketAddress {
        address: address.to_string(),
        port_specifier: Some(xds_core::socket_address::PortSpecifier::PortValue(port)),
        ..Default::default()
    };

    xds_core::Address {
        address: Some(xds_core::address::Address::SocketAddress(socket_address)),
    }
}

impl Duration {
    pub fn to_xds(&self) -> protobuf::Duration {
        protobuf::Duration {
            seconds: self.as_secs().try_into().unwrap_or(i64::MAX),
            nanos: self.subsec_nanos() as i32,
        }
    }
}
