use async_trait::async_trait;
use pop3d::MemoryMaildrop;
use smtpd::{Envelope, HandlerError, Message, MessageHandler, PlainValidator};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Deposits accepted mail into per-user in-memory maildrops, keyed by
/// the local part of each recipient address.
#[derive(Default)]
pub struct LocalDelivery {
    maildrops: BTreeMap<String, Arc<MemoryMaildrop>>,
}

impl LocalDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mailbox(&mut self, user: &str) -> Arc<MemoryMaildrop> {
        Arc::clone(
            self.maildrops
                .entry(user.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(MemoryMaildrop::new())),
        )
    }
}

fn local_part(address: &str) -> &str {
    address
        .rsplit_once('@')
        .map(|(local, _)| local)
        .unwrap_or(address)
}

#[async_trait]
impl MessageHandler for LocalDelivery {
    async fn handle(&self, envelope: &Envelope, message: &Message) -> Result<(), HandlerError> {
        // DATA without RCPT falls back to the To header
        let recipients = if envelope.recipients.is_empty() {
            &message.to
        } else {
            &envelope.recipients
        };

        let mailboxes: BTreeSet<String> = recipients
            .iter()
            .map(|r| local_part(r).to_ascii_lowercase())
            .collect();
        let mut delivered = 0;
        for mailbox in &mailboxes {
            match self.maildrops.get(mailbox) {
                Some(maildrop) => {
                    maildrop.push(message.id.clone(), message.raw.clone());
                    delivered += 1;
                }
                None => tracing::debug!("no local mailbox for {mailbox}"),
            }
        }

        tracing::info!(
            id = %message.id,
            sender = %envelope.sender,
            recipients = recipients.len(),
            delivered,
            subject = ?message.subject,
            "accepted message"
        );
        Ok(())
    }
}

/// Checks AUTH PLAIN credentials against the configured accounts
pub struct Accounts {
    passwords: BTreeMap<String, String>,
}

impl Accounts {
    pub fn new(passwords: BTreeMap<String, String>) -> Self {
        Self { passwords }
    }
}

#[async_trait]
impl PlainValidator for Accounts {
    async fn validate(&self, authzid: &str, authcid: &str, password: &str) -> bool {
        if !authzid.is_empty() && authzid != authcid {
            return false;
        }
        self.passwords
            .get(authcid)
            .map(|expected| expected == password)
            .unwrap_or(false)
    }
}
