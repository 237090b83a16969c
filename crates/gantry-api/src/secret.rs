//! Sensitive material: [Secret]s and [Artifact]s.
//!
//! Neither type will print its contents. `Debug` output and [redacted] copies
//! replace every blob with [REDACTED].
//!
//! [redacted]: Secret::redacted

use crate::shared::{impl_resource, Metadata, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The placeholder that replaces sensitive content anywhere it might be shown.
pub const REDACTED: &str = "<redacted>";

/// Opaque credential material.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Secret {
    pub metadata: Metadata,
    pub kind: SecretKind,
}

impl_resource!(Secret, ResourceKind::Secret);

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SecretKind {
    /// A PEM certificate chain and private key, with an optional root CA
    /// bundle for validating peers.
    Tls {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        cert_chain: String,

        #[serde(default, skip_serializing_if = "String::is_empty")]
        private_key: String,

        #[serde(default, skip_serializing_if = "String::is_empty")]
        root_ca: String,
    },

    /// Arbitrary key-value data, like API tokens.
    Generic { data: BTreeMap<String, String> },
}

impl Secret {
    /// Return a copy of this secret with every value replaced by [REDACTED].
    pub fn redacted(&self) -> Self {
        let kind = match &self.kind {
            SecretKind::Tls {
                cert_chain,
                private_key,
                root_ca,
            } => SecretKind::Tls {
                cert_chain: redact_str(cert_chain),
                private_key: redact_str(private_key),
                root_ca: redact_str(root_ca),
            },
            SecretKind::Generic { data } => SecretKind::Generic {
                data: data.keys().map(|k| (k.clone(), REDACTED.to_string())).collect(),
            },
        };

        Self {
            metadata: self.metadata.clone(),
            kind,
        }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("metadata", &self.metadata)
            .field("kind", &self.kind)
            .finish()
    }
}

impl std::fmt::Debug for SecretKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretKind::Tls { .. } => f.write_str("Tls { .. }"),
            SecretKind::Generic { data } => f
                .debug_struct("Generic")
                .field("keys", &data.keys().collect::<Vec<_>>())
                .finish_non_exhaustive(),
        }
    }
}

/// An arbitrary named blob, like a protobuf descriptor set.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    pub metadata: Metadata,

    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl_resource!(Artifact, ResourceKind::File);

impl Artifact {
    /// Return a copy of this artifact with every value replaced by [REDACTED].
    pub fn redacted(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            data: self
                .data
                .keys()
                .map(|k| (k.clone(), REDACTED.to_string()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("metadata", &self.metadata)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn redact_str(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    REDACTED.to_string()
}
