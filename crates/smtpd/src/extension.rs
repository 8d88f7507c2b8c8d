use crate::session::{Flow, Session};
use async_trait::async_trait;
use mailwire::TransportError;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    Duplicate(String),
    #[error("invalid name {0:?}")]
    InvalidName(String),
}

/// A verb handled outside of the built-in command table.
///
/// An extension registered for a verb replaces any built-in handling of
/// that verb. It is responsible for writing its own replies through the
/// session.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn handle(&self, session: &mut Session, args: &str) -> Result<Flow, TransportError>;

    /// The keyword line advertised in the EHLO response.
    /// An empty string advertises nothing.
    fn describe(&self) -> String;
}

#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    extensions: BTreeMap<String, Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Extension + 'static>(
        &mut self,
        verb: &str,
        extension: E,
    ) -> Result<(), RegistryError> {
        let verb = normalize_name(verb)?;
        if self.extensions.contains_key(&verb) {
            return Err(RegistryError::Duplicate(verb));
        }
        self.extensions.insert(verb, Arc::new(extension));
        Ok(())
    }

    pub fn get(&self, verb: &str) -> Option<Arc<dyn Extension>> {
        self.extensions.get(verb).cloned()
    }

    /// EHLO keyword lines, ordered by verb
    pub fn describe(&self) -> Vec<String> {
        self.extensions
            .values()
            .map(|ext| ext.describe())
            .filter(|line| !line.is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_set().entries(self.extensions.keys()).finish()
    }
}

pub(crate) fn normalize_name(name: &str) -> Result<String, RegistryError> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(name.to_ascii_uppercase())
}

#[cfg(test)]
mod test {
    use super::*;

    struct Xyzzy;

    #[async_trait]
    impl Extension for Xyzzy {
        async fn handle(&self, session: &mut Session, _args: &str) -> Result<Flow, TransportError> {
            session.write_response(250, "Nothing happens").await?;
            Ok(Flow::Continue)
        }

        fn describe(&self) -> String {
            "XYZZY".to_string()
        }
    }

    #[test]
    fn registration() {
        let mut registry = ExtensionRegistry::new();
        registry.register("xyzzy", Xyzzy).unwrap();
        k9::assert_equal!(
            registry.register("XYZZY", Xyzzy).unwrap_err(),
            RegistryError::Duplicate("XYZZY".to_string())
        );
        k9::assert_equal!(
            registry.register("two words", Xyzzy).unwrap_err(),
            RegistryError::InvalidName("two words".to_string())
        );
        assert!(registry.get("XYZZY").is_some());
        assert!(registry.get("PLUGH").is_none());
        k9::assert_equal!(registry.describe(), vec!["XYZZY".to_string()]);
        k9::assert_equal!(registry.len(), 1);
    }
}
