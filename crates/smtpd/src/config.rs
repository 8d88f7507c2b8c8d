use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Listener configuration for the SMTP engine.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SmtpServerConfig {
    #[serde(default = "SmtpServerConfig::default_listen")]
    pub listen: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Largest accepted DATA block, counted through the terminating
    /// `.` line. 0 means unbounded.
    #[serde(default = "SmtpServerConfig::default_max_message_size")]
    pub max_message_size: usize,

    /// 0 means unbounded.
    #[serde(default = "SmtpServerConfig::default_max_commands")]
    pub max_commands: usize,

    /// 0 means unbounded.
    #[serde(default)]
    pub max_connections: usize,

    /// 0 means unbounded.
    #[serde(default = "SmtpServerConfig::default_max_line_length")]
    pub max_line_length: usize,

    #[serde(default = "SmtpServerConfig::default_max_unrecognized_commands")]
    pub max_unrecognized_commands: usize,

    #[serde(
        default = "SmtpServerConfig::default_io_timeout",
        with = "humantime_serde"
    )]
    pub io_timeout: Duration,

    #[serde(default)]
    pub tls_private_key: Option<PathBuf>,

    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,

    /// Verbs that are answered with "not implemented"
    #[serde(default)]
    pub disabled: BTreeSet<String>,

    /// Refuse MAIL, RCPT and DATA until the client has authenticated
    #[serde(default)]
    pub require_authentication: bool,
}

impl SmtpServerConfig {
    fn default_listen() -> String {
        "127.0.0.1:2525".to_string()
    }

    fn default_max_message_size() -> usize {
        131072
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

impl Default for SmtpServerConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            hostname: default_hostname(),
            max_message_size: Self::default_max_message_size(),
            max_commands: Self::default_max_commands(),
            max_connections: 0,
            max_line_length: Self::default_max_line_length(),
            max_unrecognized_commands: Self::default_max_unrecognized_commands(),
            io_timeout: Self::default_io_timeout(),
            tls_private_key: None,
            tls_certificate: None,
            disabled: BTreeSet::new(),
            require_authentication: false,
        }
    }
}

pub fn default_hostname() -> String {
    gethostname::gethostname()
        .to_str()
        .unwrap_or("localhost")
        .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config: SmtpServerConfig = toml::from_str("").unwrap();
        k9::assert_equal!(config.max_message_size, 131072);
        k9::assert_equal!(config.max_commands, 100);
        k9::assert_equal!(config.max_unrecognized_commands, 3);
        k9::assert_equal!(config.io_timeout, Duration::from_secs(10));
        assert!(!config.require_authentication);
    }

    #[test]
    fn parse() {
        let config: SmtpServerConfig = toml::from_str(
            r#"
listen = "0.0.0.0:25"
hostname = "mx.example.com"
io_timeout = "1m"
max_message_size = 0
disabled = ["vrfy", "EXPN"]
"#,
        )
        .unwrap();
        k9::assert_equal!(config.listen, "0.0.0.0:25");
        k9::assert_equal!(config.io_timeout, Duration::from_secs(60));
        k9::assert_equal!(config.max_message_size, 0);
        k9::assert_equal!(config.disabled.len(), 2);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(toml::from_str::<SmtpServerConfig>("max_size = 10").is_err());
    }
}
