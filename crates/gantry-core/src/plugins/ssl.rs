use std::sync::Arc;

use gantry_api::{
    secret::{Secret, SecretKind},
    upstream::Upstream,
    ResourceRef,
};
use xds_api::pb::envoy::{
    config::{cluster::v3::Cluster, core::v3 as xds_core},
    extensions::transport_sockets::tls::v3::{CertificateValidationContext, TlsCertificate},
};
use xds_api::pb::google::protobuf;

use super::{
    Capability, DependenciesPlugin, Dependency, Params, Plugin, PluginError, UpstreamPlugin,
};
use crate::snapshot::{Config, InputSnapshot};
use crate::xds::extensions::tls::{
    common_tls_context::ValidationContextType, CommonTlsContext, DownstreamTlsContext,
    UpstreamTlsContext,
};

const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

/// Originate TLS to upstreams with an `ssl_config`.
pub struct UpstreamSslPlugin;

impl Plugin for UpstreamSslPlugin {
    fn name(&self) -> &'static str {
        "upstream_ssl"
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![
            Capability::Upstream(self.clone()),
            Capability::Dependencies(self),
        ]
    }
}

impl UpstreamPlugin for UpstreamSslPlugin {
    fn process_upstream(
        &self,
        params: &Params,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<(), PluginError> {
        let Some(ssl_config) = &upstream.ssl_config else {
            return Ok(());
        };

        let common_tls_context = match &ssl_config.secret_ref {
            Some(secret_ref) => {
                let secret = find_tls_secret(params.snapshot, secret_ref)
                    .map_err(|e| e.with_field("secret_ref").with_field("ssl_config"))?;
                common_tls_context(secret)
            }
            None => CommonTlsContext::default(),
        };

        let tls = UpstreamTlsContext {
            common_tls_context: Some(common_tls_context),
            sni: ssl_config.sni.clone().unwrap_or_default(),
        };
        out.transport_socket = Some(transport_socket(&tls)?);
        Ok(())
    }
}

impl DependenciesPlugin for UpstreamSslPlugin {
    // downstream TLS for secure VirtualServices is read from the same store,
    // so those secrets are needed too
    fn dependencies(&self, config: &Config) -> Vec<Dependency> {
        let upstream_secrets = config
            .upstreams
            .iter()
            .filter_map(|u| u.ssl_config.as_ref()?.secret_ref.clone());
        let listener_secrets = config
            .virtual_services
            .iter()
            .filter_map(|vs| Some(vs.ssl_config.as_ref()?.secret_ref.clone()));

        upstream_secrets
            .chain(listener_secrets)
            .map(Dependency::Secret)
            .collect()
    }
}

fn find_tls_secret<'a>(
    snapshot: &'a InputSnapshot,
    secret_ref: &ResourceRef,
) -> Result<&'a Secret, PluginError> {
    let secret = snapshot
        .find_secret(secret_ref)
        .ok_or_else(|| PluginError::configuration(format!("secret {secret_ref} not found")))?;

    match &secret.kind {
        SecretKind::Tls { .. } => Ok(secret),
        SecretKind::Generic { .. } => Err(PluginError::configuration(format!(
            "secret {secret_ref} is not a TLS secret"
        ))),
    }
}

fn inline_string(s: &str) -> Option<xds_core::DataSource> {
    if s.is_empty() {
        return None;
    }

    Some(xds_core::DataSource {
        specifier: Some(xds_core::data_source::Specifier::InlineString(
            s.to_string(),
        )),
        ..Default::default()
    })
}

fn common_tls_context(secret: &Secret) -> CommonTlsContext {
    let SecretKind::Tls {
        cert_chain,
        private_key,
        root_ca,
    } = &secret.kind
    else {
        return CommonTlsContext::default();
    };

    let tls_certificates = match (inline_string(cert_chain), inline_string(private_key)) {
        (None, None) => vec![],
        (certificate_chain, private_key) => vec![TlsCertificate {
            certificate_chain,
            private_key,
            ..Default::default()
        }],
    };

    let validation_context_type = inline_string(root_ca).map(|trusted_ca| {
        ValidationContextType::ValidationContext(CertificateValidationContext {
            trusted_ca: Some(trusted_ca),
            ..Default::default()
        })
    });

    CommonTlsContext {
        tls_certificates,
        validation_context_type,
        ..Default::default()
    }
}

/// A TLS transport socket wrapping an upstream or downstream TLS context.
pub(crate) fn transport_socket<M: prost::Name>(
    tls_context: &M,
) -> Result<xds_core::TransportSocket, PluginError> {
    let typed_config = protobuf::Any::from_msg(tls_context)
        .map_err(|e| PluginError::configuration(format!("failed to encode TLS context: {e}")))?;

    Ok(xds_core::TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(xds_core::transport_socket::ConfigType::TypedConfig(
            typed_config,
        )),
    })
}

/// The TLS context served to downstream clients of a secure VirtualService.
pub(crate) fn downstream_tls_context(
    snapshot: &InputSnapshot,
    secret_ref: &ResourceRef,
) -> Result<DownstreamTlsContext, PluginError> {
    let secret = find_tls_secret(snapshot, secret_ref)?;
    let SecretKind::Tls {
        cert_chain,
        private_key,
        ..
    } = &secret.kind
    else {
        return Err(PluginError::configuration(format!(
            "secret {secret_ref} is not a TLS secret"
        )));
    };

    if cert_chain.is_empty() || private_key.is_empty() {
        return Err(PluginError::configuration(format!(
            "secret {secret_ref} needs both a certificate chain and a private key"
        )));
    }

    Ok(DownstreamTlsContext {
        common_tls_context: Some(common_tls_context(secret)),
    })
}
