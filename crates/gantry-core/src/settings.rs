//! Control plane settings.
//!
//! [Settings] are read once at startup from a YAML file. Every field has a
//! default, so an empty file (or no file at all) is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use gantry_api::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// The address proxies bind their listeners to.
    pub bind_address: String,

    /// The port for plaintext HTTP listeners.
    pub bind_port: u16,

    /// The port for the TLS listener.
    pub secure_bind_port: u16,

    /// The address the xDS server listens on.
    pub xds_address: SocketAddr,

    /// The address the admin server listens on. The admin server is not
    /// started if this is unset.
    pub admin_address: Option<SocketAddr>,

    /// The namespace reports and discovered resources are written to.
    pub write_namespace: String,

    /// The namespaces to read configuration from. Defaults to every
    /// namespace.
    pub watch_namespaces: Vec<String>,

    /// The minimum time between two translations.
    pub refresh_rate: Duration,

    /// How often endpoint discovery re-resolves catalog addresses.
    pub endpoint_poll_interval: Duration,

    pub storage: StorageSettings,

    pub feature_flags: FeatureFlags,

    pub invalid_config_policy: InvalidConfigPolicy,

    /// Consul catalog integration. Disabled when unset.
    pub consul: Option<ConsulSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 8080,
            secure_bind_port: 8443,
            xds_address: SocketAddr::from(([0, 0, 0, 0], 9977)),
            admin_address: Some(SocketAddr::from(([0, 0, 0, 0], 9091))),
            write_namespace: "gantry-system".to_string(),
            watch_namespaces: Vec::new(),
            refresh_rate: Duration::from_secs(1),
            endpoint_poll_interval: Duration::from_secs(5),
            storage: StorageSettings::default(),
            feature_flags: FeatureFlags::default(),
            invalid_config_policy: InvalidConfigPolicy::default(),
            consul: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum StorageSettings {
    /// Keep everything in memory. Nothing survives a restart.
    #[default]
    Memory,

    /// Store one YAML file per object under `root`.
    File { root: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureFlags {
    /// Drop HTTP filters that declare themselves removable when no route or
    /// virtual host has per-filter config for them.
    pub remove_unused_filters: bool,

    /// Bind IPv4 listener addresses as IPv4-mapped IPv6 addresses so that
    /// listeners accept both families.
    pub dual_stack: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InvalidConfigPolicy {
    /// Replace routes that can't be translated with a direct response
    /// instead of rejecting their VirtualService.
    pub replace_invalid_routes: bool,

    pub invalid_route_response_code: u32,

    pub invalid_route_response_body: String,
}

impl Default for InvalidConfigPolicy {
    fn default() -> Self {
        Self {
            replace_invalid_routes: false,
            invalid_route_response_code: 404,
            invalid_route_response_body: "Gantry has invalid configuration. Administrators should run `gantry check` for more information.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsulSettings {
    /// The base URL of the Consul HTTP API.
    pub address: String,

    /// An ACL token sent with every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Create a TLS upstream for services that carry `tls_tag_name`.
    pub use_tls_tagging: bool,

    pub tls_tag_name: String,

    /// The Secret holding the root CA used to verify TLS upstreams.
    pub root_ca_name: String,
    pub root_ca_namespace: String,

    /// Create both a TLS and a plaintext upstream for services that have
    /// TLS and non-TLS instances.
    pub split_tls_services: bool,

    /// The tag that marks plaintext instances of a split service.
    pub no_tls_tag_name: String,
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            use_tls_tagging: false,
            tls_tag_name: "gantry-tls".to_string(),
            root_ca_name: String::new(),
            root_ca_namespace: String::new(),
            split_tls_services: false,
            no_tls_tag_name: String::new(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file and validate them.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = serde_yml::from_str(&contents)
            .map_err(|e| Error::Settings(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check for settings that can't possibly work.
    pub fn validate(&self) -> Result<()> {
        if self.bind_port == 0 || self.secure_bind_port == 0 {
            return Err(Error::Settings("bind ports must be non-zero".to_string()));
        }
        if self.bind_port == self.secure_bind_port {
            return Err(Error::Settings(format!(
                "bind_port and secure_bind_port must differ: both are {}",
                self.bind_port
            )));
        }
        if self.bind_address.is_empty() {
            return Err(Error::Settings("bind_address is required".to_string()));
        }
        if self.write_namespace.is_empty() {
            return Err(Error::Settings("write_namespace is required".to_string()));
        }
        if self.refresh_rate.is_zero() {
            return Err(Error::Settings("refresh_rate must be positive".to_string()));
        }
        if self.endpoint_poll_interval.is_zero() {
            return Err(Error::Settings(
                "endpoint_poll_interval must be positive".to_string(),
            ));
        }
        if self.invalid_config_policy.replace_invalid_routes
            && !(200..600).contains(&self.invalid_config_policy.invalid_route_response_code)
        {
            return Err(Error::Settings(format!(
                "invalid_route_response_code {} is not an HTTP status",
                self.invalid_config_policy.invalid_route_response_code
            )));
        }

        if let Some(consul) = &self.consul {
            consul.validate()?;
        }

        Ok(())
    }
}

impl ConsulSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::Settings("consul.address is required".to_string()));
        }
        if self.use_tls_tagging {
            if self.root_ca_name.is_empty() || self.root_ca_namespace.is_empty() {
                return Err(Error::Settings(
                    "consul TLS tagging requires root_ca_name and root_ca_namespace".to_string(),
                ));
            }
            if self.tls_tag_name.is_empty() {
                return Err(Error::Settings(
                    "consul TLS tagging requires tls_tag_name".to_string(),
                ));
            }
        }
        if self.split_tls_services && self.no_tls_tag_name.is_empty() {
            return Err(Error::Settings(
                "split_tls_services requires no_tls_tag_name".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings: Settings = serde_yml::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.xds_address.port(), 9977);
        assert_eq!(*settings.refresh_rate, std::time::Duration::from_secs(1));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parse() {
        let settings: Settings = serde_yml::from_str(
            r#"
bind_port: 80
secure_bind_port: 443
refresh_rate: 0.5
storage:
  type: file
  root: /etc/gantry
feature_flags:
  dual_stack: true
consul:
  address: http://consul:8500
"#,
        )
        .unwrap();

        assert_eq!(settings.bind_port, 80);
        assert_eq!(settings.refresh_rate, Duration::from_millis(500));
        assert_eq!(
            settings.storage,
            StorageSettings::File {
                root: PathBuf::from("/etc/gantry")
            }
        );
        assert!(settings.feature_flags.dual_stack);
        assert_eq!(
            settings.consul.as_ref().map(|c| c.address.as_str()),
            Some("http://consul:8500")
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_unknown_field() {
        assert!(serde_yml::from_str::<Settings>("bind_prot: 80").is_err());
    }

    #[test]
    fn test_validate() {
        let settings = Settings {
            bind_port: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            consul: Some(ConsulSettings {
                use_tls_tagging: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Settings(_))));

        let settings = Settings {
            consul: Some(ConsulSettings {
                use_tls_tagging: true,
                root_ca_name: "root-ca".to_string(),
                root_ca_namespace: "gantry-system".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());

        let settings = Settings {
            consul: Some(ConsulSettings {
                split_tls_services: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
