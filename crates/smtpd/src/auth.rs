use crate::extension::{normalize_name, RegistryError};
use crate::reply::Reply;
use crate::session::Session;
use async_trait::async_trait;
use data_encoding::BASE64;
use mailwire::TransportError;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("mechanism {0} is not available")]
    MechanismUnavailable(String),
    #[error("encryption required for requested authentication mechanism")]
    EncryptionRequired,
    #[error("authentication credentials invalid")]
    AuthenticationFailed,
    #[error("authentication cancelled by the client")]
    Cancelled,
    #[error("malformed authentication response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AuthError {
    /// The reply to send for this failure. Terminal transport failures
    /// end the session before any reply is attempted.
    pub fn reply(&self) -> Reply {
        match self {
            Self::MechanismUnavailable(_) => Reply::new(504, "Unrecognized authentication type"),
            Self::EncryptionRequired => Reply::new(
                538,
                "Encryption required for requested authentication mechanism",
            ),
            Self::AuthenticationFailed => Reply::new(535, "Authentication credentials invalid"),
            Self::Cancelled => Reply::new(501, "Authentication cancelled"),
            Self::Malformed(_) => Reply::new(501, "Malformed authentication response"),
            Self::Transport(_) => Reply::new(501, "Malformed authentication response"),
        }
    }
}

/// The identity established by a successful AUTH exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub mechanism: String,
    /// The identity to act as; usually the same as `authcid`
    pub authzid: String,
    /// The identity whose credentials were verified
    pub authcid: String,
}

/// A SASL mechanism usable with the AUTH verb.
#[async_trait]
pub trait AuthMechanism: Send + Sync {
    /// When true, the mechanism is refused on plaintext sessions.
    fn requires_encryption(&self) -> bool {
        true
    }

    /// Runs the exchange. `initial` is the initial response sent with
    /// the AUTH command and is empty if none was given; further client
    /// responses are obtained via [Session::challenge].
    async fn authenticate(&self, initial: &str, session: &mut Session)
        -> Result<Identity, AuthError>;
}

/// Mediates the AUTH verb over a fixed set of mechanisms
#[derive(Default, Clone)]
pub struct AuthNegotiator {
    mechanisms: BTreeMap<String, Arc<dyn AuthMechanism>>,
}

impl AuthNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend<M: AuthMechanism + 'static>(
        &mut self,
        name: &str,
        mechanism: M,
    ) -> Result<(), RegistryError> {
        let name = normalize_name(name)?;
        if self.mechanisms.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.mechanisms.insert(name, Arc::new(mechanism));
        Ok(())
    }

    /// Space separated mechanism names, as advertised by EHLO
    pub fn mechanism_list(&self) -> String {
        self.mechanisms
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty()
    }

    pub async fn negotiate(
        &self,
        mechanism: &str,
        initial: &str,
        session: &mut Session,
    ) -> Result<Arc<Identity>, AuthError> {
        let handler = self
            .mechanisms
            .get(&mechanism.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| AuthError::MechanismUnavailable(mechanism.to_string()))?;

        if handler.requires_encryption() && !session.is_encrypted() {
            return Err(AuthError::EncryptionRequired);
        }

        let identity = handler.authenticate(initial, session).await?;
        Ok(Arc::new(identity))
    }
}

impl std::fmt::Debug for AuthNegotiator {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_set().entries(self.mechanisms.keys()).finish()
    }
}

/// Checks the credentials presented via AUTH PLAIN
#[async_trait]
pub trait PlainValidator: Send + Sync {
    async fn validate(&self, authzid: &str, authcid: &str, password: &str) -> bool;
}

#[async_trait]
impl<F> PlainValidator for F
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    async fn validate(&self, authzid: &str, authcid: &str, password: &str) -> bool {
        (self)(authzid, authcid, password)
    }
}

/// RFC 4616 PLAIN
pub struct AuthPlain<V> {
    validator: V,
    requires_encryption: bool,
}

impl<V: PlainValidator> AuthPlain<V> {
    pub fn new(validator: V) -> Self {
        Self {
            validator,
            requires_encryption: true,
        }
    }

    /// Permit PLAIN over an unencrypted session
    pub fn allow_plaintext(mut self) -> Self {
        self.requires_encryption = false;
        self
    }
}

#[async_trait]
impl<V: PlainValidator> AuthMechanism for AuthPlain<V> {
    fn requires_encryption(&self) -> bool {
        self.requires_encryption
    }

    async fn authenticate(
        &self,
        initial: &str,
        session: &mut Session,
    ) -> Result<Identity, AuthError> {
        let response = if initial.is_empty() {
            session.challenge("").await?
        } else {
            initial.to_string()
        };
        if response == "*" {
            return Err(AuthError::Cancelled);
        }

        let decoded = BASE64
            .decode(response.as_bytes())
            .map_err(|err| AuthError::Malformed(format!("{err:#}")))?;
        let decoded =
            String::from_utf8(decoded).map_err(|err| AuthError::Malformed(format!("{err:#}")))?;

        let mut fields = decoded.split('\0');
        let (authzid, authcid, password) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(authzid), Some(authcid), Some(password), None) => (authzid, authcid, password),
            _ => {
                return Err(AuthError::Malformed(
                    "expected authzid NUL authcid NUL passwd".to_string(),
                ))
            }
        };

        if authcid.is_empty() || !self.validator.validate(authzid, authcid, password).await {
            tracing::info!("AUTH PLAIN rejected for {authcid:?}");
            return Err(AuthError::AuthenticationFailed);
        }

        Ok(Identity {
            mechanism: "PLAIN".to_string(),
            authzid: if authzid.is_empty() {
                authcid.to_string()
            } else {
                authzid.to_string()
            },
            authcid: authcid.to_string(),
        })
    }
}
