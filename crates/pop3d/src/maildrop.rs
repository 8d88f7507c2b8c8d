use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaildropError {
    #[error("no such message")]
    NoSuchMessage,
    #[error("message already deleted")]
    AlreadyDeleted,
    #[error("maildrop is locked by another session")]
    Locked,
    #[error("maildrop is not locked")]
    NotLocked,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Summary of one message in a maildrop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// Unique and persistent across sessions; reported by UIDL
    pub id: String,
    /// In octets
    pub size: usize,
}

/// A user's mailbox, as seen by a POP3 session.
///
/// Messages are addressed by 0-based index. Flagging a message only
/// marks it; it is not removed until [Maildrop::delete] is called.
/// Flagged messages are excluded from `count`, `size` and `messages`
/// and cannot be retrieved.
#[async_trait]
pub trait Maildrop: Send + Sync {
    /// Acquires exclusive access; fails with [MaildropError::Locked]
    /// if another session holds it.
    async fn lock(&self) -> Result<(), MaildropError>;

    /// Releases exclusive access. Any flags that were not committed by
    /// `delete` are discarded.
    async fn unlock(&self) -> Result<(), MaildropError>;

    async fn count(&self) -> Result<usize, MaildropError>;

    async fn size(&self) -> Result<usize, MaildropError>;

    async fn get(&self, index: usize) -> Result<MessageInfo, MaildropError>;

    /// The messages that are not flagged for deletion, with their indices
    async fn messages(&self) -> Result<Vec<(usize, MessageInfo)>, MaildropError>;

    async fn content(&self, index: usize) -> Result<Vec<u8>, MaildropError>;

    async fn flag(&self, index: usize) -> Result<(), MaildropError>;

    async fn unflag_all(&self) -> Result<(), MaildropError>;

    /// Removes the flagged messages and returns how many were removed
    async fn delete(&self) -> Result<usize, MaildropError>;
}

struct StoredMessage {
    id: String,
    content: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    messages: Vec<StoredMessage>,
    flagged: BTreeSet<usize>,
    locked: bool,
}

impl Inner {
    fn live(&self, index: usize) -> Result<&StoredMessage, MaildropError> {
        let msg = self
            .messages
            .get(index)
            .ok_or(MaildropError::NoSuchMessage)?;
        if self.flagged.contains(&index) {
            return Err(MaildropError::AlreadyDeleted);
        }
        Ok(msg)
    }

    fn live_messages(&self) -> impl Iterator<Item = (usize, &StoredMessage)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.flagged.contains(idx))
    }
}

/// A maildrop held entirely in memory
#[derive(Default)]
pub struct MemoryMaildrop {
    inner: Mutex<Inner>,
}

impl MemoryMaildrop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<S: Into<String>, B: Into<Vec<u8>>>(&self, id: S, content: B) {
        self.inner.lock().messages.push(StoredMessage {
            id: id.into(),
            content: content.into(),
        });
    }

    /// Ids of every stored message, including flagged ones
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .messages
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }
}

#[async_trait]
impl Maildrop for MemoryMaildrop {
    async fn lock(&self) -> Result<(), MaildropError> {
        let mut inner = self.inner.lock();
        if inner.locked {
            return Err(MaildropError::Locked);
        }
        inner.locked = true;
        Ok(())
    }

    async fn unlock(&self) -> Result<(), MaildropError> {
        let mut inner = self.inner.lock();
        if !inner.locked {
            return Err(MaildropError::NotLocked);
        }
        inner.locked = false;
        inner.flagged.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize, MaildropError> {
        Ok(self.inner.lock().live_messages().count())
    }

    async fn size(&self) -> Result<usize, MaildropError> {
        Ok(self
            .inner
            .lock()
            .live_messages()
            .map(|(_, m)| m.content.len())
            .sum())
    }

    async fn get(&self, index: usize) -> Result<MessageInfo, MaildropError> {
        let inner = self.inner.lock();
        let msg = inner.live(index)?;
        Ok(MessageInfo {
            id: msg.id.clone(),
            size: msg.content.len(),
        })
    }

    async fn messages(&self) -> Result<Vec<(usize, MessageInfo)>, MaildropError> {
        Ok(self
            .inner
            .lock()
            .live_messages()
            .map(|(idx, m)| {
                (
                    idx,
                    MessageInfo {
                        id: m.id.clone(),
                        size: m.content.len(),
                    },
                )
            })
            .collect())
    }

    async fn content(&self, index: usize) -> Result<Vec<u8>, MaildropError> {
        Ok(self.inner.lock().live(index)?.content.clone())
    }

    async fn flag(&self, index: usize) -> Result<(), MaildropError> {
        let mut inner = self.inner.lock();
        inner.live(index)?;
        inner.flagged.insert(index);
        Ok(())
    }

    async fn unflag_all(&self) -> Result<(), MaildropError> {
        self.inner.lock().flagged.clear();
        Ok(())
    }

    async fn delete(&self) -> Result<usize, MaildropError> {
        let mut inner = self.inner.lock();
        let flagged = std::mem::take(&mut inner.flagged);
        let mut index = 0;
        inner.messages.retain(|_| {
            let keep = !flagged.contains(&index);
            index += 1;
            keep
        });
        Ok(flagged.len())
    }
}
