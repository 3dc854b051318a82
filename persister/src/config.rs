use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_max_mps")]
    pub max_mps: u32,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
    /// Directory for the filesystem-backed warehouse sink.
    pub datastore_dir: PathBuf,
}

fn default_max_mps() -> u32 {
    1000
}

fn default_num_workers() -> usize {
    1
}

fn default_flush_size() -> usize {
    50
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_flush_timeout_secs() -> u64 {
    20
}

impl Config {
    pub fn options(&self) -> crate::persister::PersisterOptions {
        crate::persister::PersisterOptions {
            max_mps: self.max_mps,
            num_workers: self.num_workers,
            flush_size: self.flush_size,
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            flush_timeout: Duration::from_secs(self.flush_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_omitted_fields() {
        let config: Config =
            serde_json::from_str(r#"{"datastore_dir": "/tmp/records"}"#).unwrap();
        let options = config.options();
        assert_eq!(options.max_mps, 1000);
        assert_eq!(options.num_workers, 1);
        assert_eq!(options.flush_size, 50);
        assert_eq!(options.flush_interval, Duration::from_secs(5));
        assert_eq!(options.flush_timeout, Duration::from_secs(20));
    }
}
