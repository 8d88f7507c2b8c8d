use crate::config::MaildConfig;
use crate::delivery::{Accounts, LocalDelivery};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use pop3d::{Pop3Server, StaticMaildropProvider};
use smtpd::{AuthNegotiator, AuthPlain, SmtpServer};
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

mod config;
mod delivery;

const DEFAULT_LOG_FILTER: &str = "maild=info,smtpd=info,pop3d=info,mailwire=info";

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

#[derive(Debug, Parser)]
#[command(about = "smtp and pop3 daemon")]
struct Opt {
    /// Configuration file to load.
    /// If omitted, only an SMTP listener with default settings runs.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let (non_blocking, _non_blocking_flusher);
    let log_writer = if let Some(log_dir) = &opts.diag_log_dir {
        let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
        (non_blocking, _non_blocking_flusher) = tracing_appender::non_blocking(file_appender);
        BoxMakeWriter::new(non_blocking)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
    let layer = match opts.diag_format {
        DiagnosticFormat::Pretty => layer.pretty().boxed(),
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    let env_filter = EnvFilter::try_new(
        std::env::var("MAILD_LOG")
            .as_deref()
            .unwrap_or(DEFAULT_LOG_FILTER),
    )?;
    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .init();

    let config = match &opts.config {
        Some(path) => MaildConfig::load(path)?,
        None => MaildConfig::default(),
    };
    start_listeners(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}

async fn start_listeners(config: MaildConfig) -> anyhow::Result<()> {
    let mut delivery = LocalDelivery::new();
    let mut provider = StaticMaildropProvider::new();
    for (user, password) in &config.accounts {
        let maildrop = delivery.add_mailbox(user);
        provider.add_user(user, password, maildrop);
    }

    let mut smtp = SmtpServer::new(config.smtp.clone(), delivery).with_configured_tls()?;
    if !config.accounts.is_empty() {
        let mut plain = AuthPlain::new(Accounts::new(config.accounts.clone()));
        if config.allow_plaintext_auth {
            plain = plain.allow_plaintext();
        }
        let mut auth = AuthNegotiator::new();
        auth.extend("PLAIN", plain)?;
        smtp = smtp.with_auth(auth);
    } else if config.smtp.require_authentication {
        tracing::warn!("require_authentication is set but no accounts are configured");
    }

    let listener = smtp.bind().await?;
    tokio::spawn(async move {
        if let Err(err) = listener.serve().await {
            tracing::error!("smtp listener failed: {err:#}");
        }
    });

    if let Some(pop3) = config.pop3 {
        let listener = Pop3Server::new(pop3, provider)
            .with_configured_tls()?
            .bind()
            .await?;
        tokio::spawn(async move {
            if let Err(err) = listener.serve().await {
                tracing::error!("pop3 listener failed: {err:#}");
            }
        });
    }

    Ok(())
}
