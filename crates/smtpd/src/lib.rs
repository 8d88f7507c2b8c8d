//! An SMTP server session engine.
//!
//! [SmtpServer] collects the configuration, the accept handler and any
//! extensions or AUTH mechanisms, then freezes them into an
//! [SmtpService] that runs one [Session] per connection.

pub mod address;
pub mod auth;
pub mod config;
pub mod extension;
pub mod handler;
pub mod message;
pub mod reply;
mod server;
pub mod session;

pub use auth::{AuthError, AuthMechanism, AuthNegotiator, AuthPlain, Identity, PlainValidator};
pub use config::SmtpServerConfig;
pub use extension::{Extension, ExtensionRegistry, RegistryError};
pub use handler::{Envelope, HandlerError, MessageHandler};
pub use message::{DecodeError, MailparseDecoder, Message, MessageDecoder, MessagePart};
pub use reply::Reply;
pub use server::{SmtpListener, SmtpServer, SmtpService};
pub use session::{Flow, Session};
