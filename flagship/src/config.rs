use gateway::config::Config as GatewayConfig;
use persister::config::Config as PersisterConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize, Default)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
}

/// Upstream admin services the gateway and persister resolve origin data
/// from.
#[derive(Debug, Deserialize)]
pub struct UpstreamsConfig {
    pub account_service_url: String,
    pub feature_service_url: String,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub upstreams: Option<UpstreamsConfig>,
    pub gateway: Option<GatewayConfig>,
    pub persister: Option<PersisterConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn standalone_config() {
        let yaml = r#"
            upstreams:
                account_service_url: http://127.0.0.1:9101
                feature_service_url: http://127.0.0.1:9102
            gateway:
                listener:
                    host: 0.0.0.0
                    port: 8080
            persister:
                flush_size: 10
                datastore_dir: /var/lib/flagship/records
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let gateway_config = config.gateway.expect("gateway config");
        assert_eq!(gateway_config.listener.port, 8080);
        // Unset TTLs fall back to their defaults.
        assert_eq!(gateway_config.features_cache_ttl_secs, 60);

        let persister_config = config.persister.expect("persister config");
        assert_eq!(persister_config.flush_size, 10);
        assert_eq!(persister_config.max_mps, 1000);
        assert!(config.common.metrics.is_none());
    }
}
