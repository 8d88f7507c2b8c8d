/// An SMTP status code plus its text.
/// Text containing newlines is sent as a continuation group where every
/// line but the last uses `code-text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new<S: Into<String>>(code: u16, text: S) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn multi_line<I, S>(code: u16, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines: Vec<String> = lines.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self::new(code, lines.join("\n"))
    }

    /// The lines as they appear on the wire, without CRLF
    pub fn wire_lines(&self) -> Vec<String> {
        let code = self.code;
        let mut lines = self.text.lines().peekable();
        if lines.peek().is_none() {
            return vec![format!("{code} ")];
        }
        let mut result = vec![];
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            let sep = if is_last { ' ' } else { '-' };
            result.push(format!("{code}{sep}{line}"));
        }
        result
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} {}", self.code, self.text)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_line() {
        k9::assert_equal!(Reply::new(250, "OK").wire_lines(), vec!["250 OK"]);
        k9::assert_equal!(Reply::new(334, "").wire_lines(), vec!["334 "]);
    }

    #[test]
    fn continuation() {
        let reply = Reply::multi_line(250, ["mx Hello 127.0.0.1", "SIZE 1024", "HELP"]);
        k9::assert_equal!(
            reply.wire_lines(),
            vec!["250-mx Hello 127.0.0.1", "250-SIZE 1024", "250 HELP"]
        );
    }
}
