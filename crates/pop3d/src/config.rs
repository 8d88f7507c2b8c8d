use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Pop3ServerConfig {
    #[serde(default = "Pop3ServerConfig::default_listen")]
    pub listen: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// 0 means unbounded.
    #[serde(default = "Pop3ServerConfig::default_max_commands")]
    pub max_commands: usize,

    /// 0 means unbounded.
    #[serde(default)]
    pub max_connections: usize,

    /// 0 means unbounded.
    #[serde(default = "Pop3ServerConfig::default_max_line_length")]
    pub max_line_length: usize,

    #[serde(default = "Pop3ServerConfig::default_max_unrecognized_commands")]
    pub max_unrecognized_commands: usize,

    #[serde(
        default = "Pop3ServerConfig::default_io_timeout",
        with = "humantime_serde"
    )]
    pub io_timeout: Duration,

    #[serde(default)]
    pub tls_private_key: Option<PathBuf>,

    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,

    #[serde(default)]
    pub disabled: BTreeSet<String>,
}

impl Pop3ServerConfig {
    fn default_listen() -> String {
        "127.0.0.1:1110".to_string()
    }

    fn default_max_commands() -> usize {
        100
    }

    fn default_max_line_length() -> usize {
        1000
    }

    fn default_max_unrecognized_commands() -> usize {
        3
    }

    fn default_io_timeout() -> Duration {
        mailwire::DEFAULT_IO_TIMEOUT
    }
}

impl Default for Pop3ServerConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            hostname: default_hostname(),
            max_commands: Self::default_max_commands(),
            max_connections: 0,
            max_line_length: Self::default_max_line_length(),
            max_unrecognized_commands: Self::default_max_unrecognized_commands(),
            io_timeout: Self::default_io_timeout(),
            tls_private_key: None,
            tls_certificate: None,
            disabled: BTreeSet::new(),
        }
    }
}

fn default_hostname() -> String {
    gethostname::gethostname()
        .to_str()
        .unwrap_or("localhost")
        .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        let config: Pop3ServerConfig = toml::from_str(
            r#"
listen = "0.0.0.0:110"
io_timeout = "30s"
disabled = ["top"]
"#,
        )
        .unwrap();
        k9::assert_equal!(config.listen, "0.0.0.0:110");
        k9::assert_equal!(config.io_timeout, Duration::from_secs(30));
        k9::assert_equal!(config.max_commands, 100);
        assert!(config.disabled.contains("top"));
    }
}
