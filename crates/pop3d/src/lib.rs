//! A POP3 server session engine over a pluggable [Maildrop].

pub mod config;
pub mod maildrop;
pub mod provider;
mod server;
pub mod session;

pub use config::Pop3ServerConfig;
pub use maildrop::{Maildrop, MaildropError, MemoryMaildrop, MessageInfo};
pub use provider::{Credentials, MaildropProvider, Pop3AuthError, StaticMaildropProvider};
pub use server::{Pop3Listener, Pop3Server, Pop3Service};
pub use session::{Pop3Session, Pop3State};
