use anyhow::Context;
use pop3d::Pop3ServerConfig;
use serde::Deserialize;
use smtpd::SmtpServerConfig;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct MaildConfig {
    #[serde(default)]
    pub smtp: SmtpServerConfig,

    /// The POP3 listener only runs when this table is present
    #[serde(default)]
    pub pop3: Option<Pop3ServerConfig>,

    /// Local users and their passwords. Each user gets an in-memory
    /// maildrop that receives mail addressed to `user@<any domain>`,
    /// readable over POP3. The same credentials are accepted by
    /// SMTP AUTH PLAIN.
    #[serde(default)]
    pub accounts: BTreeMap<String, String>,

    /// Offer AUTH PLAIN on sessions that have not negotiated STARTTLS
    #[serde(default)]
    pub allow_plaintext_auth: bool,
}

impl MaildConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
