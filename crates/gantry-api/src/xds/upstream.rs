use xds_api::pb::envoy::config::{cluster::v3 as xds_cluster, core::v3 as xds_core};

use crate::{
    error::Error,
    upstream::{CircuitBreakers, HealthCheck, HealthCheckKind, Http2ProtocolOptions, LoadBalancer},
};

/// The smallest HTTP/2 flow control window Envoy accepts.
pub const MIN_WINDOW_SIZE: u32 = 65_535;

/// The largest HTTP/2 flow control window Envoy accepts.
pub const MAX_WINDOW_SIZE: u32 = 2_147_483_647;

impl LoadBalancer {
    pub fn to_xds(
        &self,
    ) -> (
        xds_cluster::cluster::LbPolicy,
        Option<xds_cluster::cluster::LbConfig>,
    ) {
        use xds_cluster::cluster::{LbConfig, LbPolicy};

        match self {
            LoadBalancer::RoundRobin => (
                LbPolicy::RoundRobin,
                Some(LbConfig::RoundRobinLbConfig(Default::default())),
            ),
            LoadBalancer::LeastRequest { choice_count } => (
                LbPolicy::LeastRequest,
                Some(LbConfig::LeastRequestLbConfig(
                    xds_cluster::cluster::LeastRequestLbConfig {
                        choice_count: choice_count.map(Into::into),
                        ..Default::default()
                    },
                )),
            ),
            LoadBalancer::Random => (LbPolicy::Random, None),
            LoadBalancer::RingHash { min_ring_size } => (
                LbPolicy::RingHash,
                Some(LbConfig::RingHashLbConfig(
                    xds_cluster::cluster::RingHashLbConfig {
                        minimum_ring_size: min_ring_size.map(Into::into),
                        hash_function:
                            xds_cluster::cluster::ring_hash_lb_config::HashFunction::XxHash as i32,
                        maximum_ring_size: None,
                    },
                )),
            ),
            LoadBalancer::Maglev => (LbPolicy::Maglev, None),
        }
    }
}

impl HealthCheck {
    pub fn to_xds(&self) -> xds_core::HealthCheck {
        use xds_core::health_check::{HealthChecker, HttpHealthCheck, TcpHealthCheck};

        let health_checker = match &self.check {
            HealthCheckKind::Http { path, host } => HealthChecker::HttpHealthCheck(HttpHealthCheck {
                path: path.clone(),
                host: host.clone().unwrap_or_default(),
                ..Default::default()
            }),
            HealthCheckKind::Tcp => HealthChecker::TcpHealthCheck(TcpHealthCheck::default()),
        };

        xds_core::HealthCheck {
            timeout: Some(self.timeout.to_xds()),
            interval: Some(self.interval.to_xds()),
            healthy_threshold: Some(self.healthy_threshold.into()),
            unhealthy_threshold: Some(self.unhealthy_threshold.into()),
            health_checker: Some(health_checker),
            ..Default::default()
        }
    }
}

impl CircuitBreakers {
    pub fn to_xds(&self) -> xds_cluster::CircuitBreakers {
        let thresholds = xds_cluster::circuit_breakers::Thresholds {
            max_connections: self.max_connections.map(Into::into),
            max_pending_requests: self.max_pending_requests.map(Into::into),
            max_requests: self.max_requests.map(Into::into),
            max_retries: self.max_retries.map(Into::into),
            ..Default::default()
        };

        xds_cluster::CircuitBreakers {
            thresholds: vec![thresholds],
            ..Default::default()
        }
    }
}

impl Http2ProtocolOptions {
    /// Convert to xDS, validating that flow control windows are in the range
    /// Envoy accepts.
    pub fn to_xds(&self) -> Result<xds_core::Http2ProtocolOptions, Error> {
        let initial_stream_window_size = self
            .initial_stream_window_size
            .map(|size| validate_window_size(size).map_err(|e| e.with_field("initial_stream_window_size")))
            .transpose()?;

        let initial_connection_window_size = self
            .initial_connection_window_size
            .map(|size| {
                validate_window_size(size).map_err(|e| e.with_field("initial_connection_window_size"))
            })
            .transpose()?;

        Ok(xds_core::Http2ProtocolOptions {
            initial_stream_window_size: initial_stream_window_size.map(Into::into),
            initial_connection_window_size: initial_connection_window_size.map(Into::into),
            max_concurrent_streams: self.max_concurrent_streams.map(Into::into),
            ..Default::default()
        })
    }
}

fn validate_window_size(size: u32) -> Result<u32, Error> {
    if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&size) {
        return Err(Error::new(format!(
            "window size {size} must be between {MIN_WINDOW_SIZE} and {MAX_WINDOW_SIZE}"
        )));
    }
    Ok(size)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Duration;

    #[test]
    fn test_window_size_bounds() {
        let ok = Http2ProtocolOptions {
            initial_stream_window_size: Some(MIN_WINDOW_SIZE),
            initial_connection_window_size: Some(MAX_WINDOW_SIZE),
            max_concurrent_streams: Some(100),
        };
        let xds = ok.to_xds().unwrap();
        assert_eq!(
            xds.initial_stream_window_size.map(|v| v.value),
            Some(MIN_WINDOW_SIZE)
        );

        let too_small = Http2ProtocolOptions {
            initial_stream_window_size: Some(MIN_WINDOW_SIZE - 1),
            ..Default::default()
        };
        let err = too_small.to_xds().unwrap_err();
        assert_eq!(err.path(), "initial_stream_window_size");

        let too_big = Http2ProtocolOptions {
            initial_connection_window_size: Some(MAX_WINDOW_SIZE + 1),
            ..Default::default()
        };
        assert!(too_big.to_xds().is_err());
    }

    #[test]
    fn test_lb_policy() {
        let (policy, config) = LoadBalancer::RingHash {
            min_ring_size: Some(1024),
        }
        .to_xds();
        assert_eq!(policy, xds_cluster::cluster::LbPolicy::RingHash);
        let Some(xds_cluster::cluster::LbConfig::RingHashLbConfig(config)) = config else {
            panic!("expected a ring hash config");
        };
        assert_eq!(crate::value_or_default!(config.minimum_ring_size, 0), 1024);

        let (policy, config) = LoadBalancer::Random.to_xds();
        assert_eq!(policy, xds_cluster::cluster::LbPolicy::Random);
        assert!(config.is_none());
    }

    #[test]
    fn test_health_check() {
        let hc = HealthCheck {
            timeout: Duration::from_secs(1),
            interval: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            check: HealthCheckKind::Http {
                path: "/healthz".to_string(),
                host: None,
            },
        }
        .to_xds();

        assert_eq!(hc.interval.map(|d| d.seconds), Some(5));
        assert_eq!(crate::value_or_default!(hc.unhealthy_threshold, 0), 3);
    }
}
