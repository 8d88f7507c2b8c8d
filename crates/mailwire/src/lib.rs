//! Building blocks shared by the SMTP and POP3 session engines:
//! a deadline-bounded line transport that can be upgraded to TLS in
//! place, command framing, and per-session flood control.

pub mod command;
pub mod error;
pub mod limiter;
pub mod policy;
pub mod stuffing;
pub mod tls;
pub mod traits;
pub mod transport;

pub use command::Command;
pub use error::TransportError;
pub use limiter::{ConnectionLimiter, ConnectionPermit};
pub use policy::{FloodPolicy, Verdict};
pub use traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
pub use transport::{Transport, DEFAULT_IO_TIMEOUT};
