use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("expected {0}")]
    MissingPrefix(&'static str),
    #[error("unterminated address: {0:?}")]
    Unterminated(String),
    #[error("address has no domain: {0:?}")]
    NoDomain(String),
}

/// Extracts the mailbox from a MAIL/RCPT argument string.
/// Accepts `FROM:<local@domain> params`, `FROM: local@domain` and a bare
/// `local@domain`. The null path `<>` yields an empty string.
pub fn extract_address(args: &str, prefix: &'static str) -> Result<String, AddressError> {
    let args = args.trim();
    let rest = match args.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => args[prefix.len()..].trim_start(),
        _ if args.contains(':') => return Err(AddressError::MissingPrefix(prefix)),
        _ => args,
    };

    let address = match rest.strip_prefix('<') {
        Some(inner) => {
            let rangle = inner
                .find('>')
                .ok_or_else(|| AddressError::Unterminated(rest.to_string()))?;
            &inner[..rangle]
        }
        None => rest.split_whitespace().next().unwrap_or(""),
    };

    if address.is_empty() {
        return Ok(String::new());
    }
    match address.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
            Ok(address.to_string())
        }
        _ => Err(AddressError::NoDomain(address.to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn extraction() {
        assert_equal!(
            extract_address("FROM:<a@b.com>", "FROM:").unwrap(),
            "a@b.com"
        );
        assert_equal!(
            extract_address("from: <a@b.com> SIZE=100", "FROM:").unwrap(),
            "a@b.com"
        );
        assert_equal!(extract_address("c@d.com", "TO:").unwrap(), "c@d.com");
        assert_equal!(extract_address("FROM:<>", "FROM:").unwrap(), "");
        assert_equal!(
            extract_address("TO:<c@d.com", "TO:").unwrap_err(),
            AddressError::Unterminated("<c@d.com".to_string())
        );
        assert_equal!(
            extract_address("TO:<postmaster>", "TO:").unwrap_err(),
            AddressError::NoDomain("postmaster".to_string())
        );
        assert_equal!(
            extract_address("FROM:<a@b.com>", "TO:").unwrap_err(),
            AddressError::MissingPrefix("TO:")
        );
    }
}
