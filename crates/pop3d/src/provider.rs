use crate::maildrop::{Maildrop, MaildropError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Pop3AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("authentication method not supported")]
    Unsupported,
    #[error(transparent)]
    Maildrop(#[from] MaildropError),
}

/// What a client presented in the AUTHORIZATION state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// USER followed by PASS
    User { user: String, password: String },
    /// APOP: `digest` is the hex MD5 of `timestamp` followed by the
    /// shared secret, where `timestamp` is the one from the greeting
    Apop {
        user: String,
        timestamp: String,
        digest: String,
    },
}

impl Credentials {
    pub fn user(&self) -> &str {
        match self {
            Self::User { user, .. } | Self::Apop { user, .. } => user,
        }
    }
}

/// Resolves credentials to the user's maildrop.
#[async_trait]
pub trait MaildropProvider: Send + Sync {
    async fn open(&self, credentials: &Credentials) -> Result<Arc<dyn Maildrop>, Pop3AuthError>;

    /// When true, the greeting carries an APOP timestamp
    fn supports_apop(&self) -> bool {
        false
    }
}

/// A fixed table of users, passwords and maildrops.
/// Only USER/PASS is supported.
#[derive(Default)]
pub struct StaticMaildropProvider {
    users: HashMap<String, (String, Arc<dyn Maildrop>)>,
}

impl StaticMaildropProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user<M: Maildrop + 'static>(
        &mut self,
        user: &str,
        password: &str,
        maildrop: Arc<M>,
    ) -> &mut Self {
        let maildrop: Arc<dyn Maildrop> = maildrop;
        self.users
            .insert(user.to_string(), (password.to_string(), maildrop));
        self
    }
}

#[async_trait]
impl MaildropProvider for StaticMaildropProvider {
    async fn open(&self, credentials: &Credentials) -> Result<Arc<dyn Maildrop>, Pop3AuthError> {
        match credentials {
            Credentials::User { user, password } => match self.users.get(user) {
                Some((expected, maildrop)) if expected == password => Ok(Arc::clone(maildrop)),
                _ => Err(Pop3AuthError::InvalidCredentials),
            },
            Credentials::Apop { .. } => Err(Pop3AuthError::Unsupported),
        }
    }
}
