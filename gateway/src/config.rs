use serde::Deserialize;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub listener: Listener,
    #[serde(default = "default_api_key_cache_ttl_secs")]
    pub api_key_cache_ttl_secs: u64,
    #[serde(default = "default_features_cache_ttl_secs")]
    pub features_cache_ttl_secs: u64,
    #[serde(default = "default_segment_users_cache_ttl_secs")]
    pub segment_users_cache_ttl_secs: u64,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

fn default_api_key_cache_ttl_secs() -> u64 {
    300
}

fn default_features_cache_ttl_secs() -> u64 {
    60
}

fn default_segment_users_cache_ttl_secs() -> u64 {
    60
}

fn default_publish_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Config {
    pub fn options(&self) -> crate::service::GatewayOptions {
        use std::time::Duration;
        crate::service::GatewayOptions {
            api_key_cache_ttl: Duration::from_secs(self.api_key_cache_ttl_secs),
            features_cache_ttl: Duration::from_secs(self.features_cache_ttl_secs),
            segment_users_cache_ttl: Duration::from_secs(self.segment_users_cache_ttl_secs),
            publish_timeout: Duration::from_secs(self.publish_timeout_secs),
        }
    }
}
