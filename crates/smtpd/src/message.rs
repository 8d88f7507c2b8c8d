use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{0}")]
    Parse(#[from] mailparse::MailParseError),
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("{0} header contains no addresses")]
    NoAddresses(&'static str),
}

/// A message accepted by the DATA phase, decoded into the parts that a
/// handler typically wants to look at.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Queue identifier reported back to the client
    pub id: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub headers: Vec<(String, String)>,
    pub parts: Vec<MessagePart>,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessagePart {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Turns the raw DATA block into a [Message].
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<Message, DecodeError>;
}

/// Decodes RFC 5322 messages with `mailparse`.
/// A message must carry parseable `From` and `To` headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MailparseDecoder;

impl MessageDecoder for MailparseDecoder {
    fn decode(&self, data: &[u8]) -> Result<Message, DecodeError> {
        let parsed = mailparse::parse_mail(data)?;

        let from = addresses(&parsed, "From")?;
        let to = addresses(&parsed, "To")?;
        let subject = parsed.headers.get_first_value("Subject");
        let headers = parsed
            .headers
            .iter()
            .map(|h| (h.get_key(), h.get_value()))
            .collect();

        let mut parts = vec![];
        collect_parts(&parsed, &mut parts)?;

        Ok(Message {
            id: uuid::Uuid::new_v4().simple().to_string(),
            from,
            to,
            subject,
            headers,
            parts,
            raw: data.to_vec(),
        })
    }
}

fn addresses(parsed: &ParsedMail, name: &'static str) -> Result<Vec<String>, DecodeError> {
    let header = parsed
        .headers
        .get_first_header(name)
        .ok_or(DecodeError::MissingHeader(name))?;
    let list = mailparse::addrparse_header(header)?;
    let mut result = vec![];
    for addr in list.iter() {
        match addr {
            MailAddr::Single(info) => result.push(info.addr.clone()),
            MailAddr::Group(group) => {
                result.extend(group.addrs.iter().map(|info| info.addr.clone()))
            }
        }
    }
    if result.is_empty() {
        return Err(DecodeError::NoAddresses(name));
    }
    Ok(result)
}

fn collect_parts(parsed: &ParsedMail, parts: &mut Vec<MessagePart>) -> Result<(), DecodeError> {
    if parsed.subparts.is_empty() {
        parts.push(MessagePart {
            content_type: parsed.ctype.mimetype.clone(),
            body: parsed.get_body_raw()?,
        });
    } else {
        for sub in &parsed.subparts {
            collect_parts(sub, parts)?;
        }
    }
    Ok(())
}
