//! Envoy extension messages that `xds-api` doesn't generate.
//!
//! Only the fields Gantry sets are declared. Tags match the upstream Envoy
//! protos, so proxies decode these like any other typed config, and fields
//! Envoy knows about but we don't declare are simply never written.

use std::collections::BTreeMap;

use xds_api::pb::envoy::config::core::v3 as xds_core;
use xds_api::pb::google::protobuf;

macro_rules! impl_name {
    ($msg:ty, $package:literal, $name:literal) => {
        impl prost::Name for $msg {
            const NAME: &'static str = $name;
            const PACKAGE: &'static str = $package;

            fn full_name() -> String {
                concat!($package, ".", $name).to_string()
            }

            fn type_url() -> String {
                concat!("type.googleapis.com/", $package, ".", $name).to_string()
            }
        }
    };
}

/// `envoy.config.core.v3.Metadata` with sorted maps.
///
/// Typed configs are packed into `Any` bytes once, so a `HashMap` inside one
/// would make equal configs encode differently. This is wire compatible with
/// `Metadata` holding `google.protobuf.Struct` values.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct SortedMetadata {
    #[prost(btree_map = "string, message", tag = "1")]
    pub filter_metadata: BTreeMap<String, SortedStruct>,
}

/// `google.protobuf.Struct` with sorted fields.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct SortedStruct {
    #[prost(btree_map = "string, message", tag = "1")]
    pub fields: BTreeMap<String, protobuf::Value>,
}

impl From<xds_core::Metadata> for SortedMetadata {
    fn from(metadata: xds_core::Metadata) -> Self {
        let filter_metadata = metadata
            .filter_metadata
            .into_iter()
            .map(|(k, v)| {
                let fields = v.fields.into_iter().collect();
                (k, SortedStruct { fields })
            })
            .collect();
        Self { filter_metadata }
    }
}

/// `envoy.extensions.transport_sockets.tls.v3`
pub(crate) mod tls {
    use xds_api::pb::envoy::extensions::transport_sockets::tls::v3::{
        CertificateValidationContext, TlsCertificate,
    };

    #[derive(Clone, PartialEq, prost::Message)]
    pub(crate) struct CommonTlsContext {
        #[prost(message, repeated, tag = "2")]
        pub tls_certificates: Vec<TlsCertificate>,

        #[prost(string, repeated, tag = "4")]
        pub alpn_protocols: Vec<String>,

        #[prost(oneof = "common_tls_context::ValidationContextType", tags = "3")]
        pub validation_context_type: Option<common_tls_context::ValidationContextType>,
    }

    pub(crate) mod common_tls_context {
        use super::CertificateValidationContext;

        #[derive(Clone, PartialEq, prost::Oneof)]
        pub(crate) enum ValidationContextType {
            #[prost(message, tag = "3")]
            ValidationContext(CertificateValidationContext),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub(crate) struct UpstreamTlsContext {
        #[prost(message, optional, tag = "1")]
        pub common_tls_context: Option<CommonTlsContext>,

        #[prost(string, tag = "2")]
        pub sni: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub(crate) struct DownstreamTlsContext {
        #[prost(message, optional, tag = "1")]
        pub common_tls_context: Option<CommonTlsContext>,
    }

    impl_name!(
        CommonTlsContext,
        "envoy.extensions.transport_sockets.tls.v3",
        "CommonTlsContext"
    );
    impl_name!(
        UpstreamTlsContext,
        "envoy.extensions.transport_sockets.tls.v3",
        "UpstreamTlsContext"
    );
    impl_name!(
        DownstreamTlsContext,
        "envoy.extensions.transport_sockets.tls.v3",
        "DownstreamTlsContext"
    );
}

/// `envoy.extensions.filters.network.tcp_proxy.v3`
pub(crate) mod tcp_proxy {
    #[derive(Clone, PartialEq, prost::Message)]
    pub(crate) struct TcpProxy {
        #[prost(string, tag = "1")]
        pub stat_prefix: String,

        #[prost(oneof = "tcp_proxy::ClusterSpecifier", tags = "2, 10")]
        pub cluster_specifier: Option<tcp_proxy::ClusterSpecifier>,
    }

    pub(crate) mod tcp_proxy {
        use super::super::SortedMetadata as Metadata;

        #[derive(Clone, PartialEq, prost::Message)]
        pub(crate) struct WeightedCluster {
            #[prost(message, repeated, tag = "1")]
            pub clusters: Vec<weighted_cluster::ClusterWeight>,
        }

        pub(crate) mod weighted_cluster {
            use super::Metadata;

            #[derive(Clone, PartialEq, prost::Message)]
            pub(crate) struct ClusterWeight {
                #[prost(string, tag = "1")]
                pub name: String,

                #[prost(uint32, tag = "2")]
                pub weight: u32,

                #[prost(message, optional, tag = "3")]
                pub metadata_match: Option<Metadata>,
            }
        }

        #[derive(Clone, PartialEq, prost::Oneof)]
        pub(crate) enum ClusterSpecifier {
            #[prost(string, tag = "2")]
            Cluster(String),

            #[prost(message, tag = "10")]
            WeightedClusters(WeightedCluster),
        }
    }

    impl_name!(
        TcpProxy,
        "envoy.extensions.filters.network.tcp_proxy.v3",
        "TcpProxy"
    );
}

/// `envoy.extensions.filters.listener.tls_inspector.v3`
pub(crate) mod tls_inspector {
    #[derive(Clone, PartialEq, prost::Message)]
    pub(crate) struct TlsInspector {}

    impl_name!(
        TlsInspector,
        "envoy.extensions.filters.listener.tls_inspector.v3",
        "TlsInspector"
    );
}
