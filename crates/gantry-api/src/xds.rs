//! Conversions from configuration types to Envoy xDS protobufs.
//!
//! Only the parts of a resource that can be derived from a single
//! configuration object live here. Assembling full clusters, route
//! configurations and listeners is the translator's job.

mod http;
mod shared;
mod upstream;

pub use shared::{ads_config_source, exact_string_matcher, regex_matcher, socket_address};
pub use upstream::{MAX_WINDOW_SIZE, MIN_WINDOW_SIZE};
