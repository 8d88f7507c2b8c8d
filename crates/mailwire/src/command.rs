/// A single client command line split into its verb and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The upper-cased first token of the line
    pub verb: String,
    /// Everything after the first space, exactly as sent
    pub args: String,
}

impl Command {
    /// Splits a (trimmed) line on the first space.
    /// This never fails; a line with no space has empty args.
    pub fn parse(line: &str) -> Self {
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args),
            None => (line, ""),
        };
        Self {
            verb: verb.to_ascii_uppercase(),
            args: args.to_string(),
        }
    }

    pub fn is(&self, verb: &str) -> bool {
        self.verb.eq_ignore_ascii_case(verb)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_commands() {
        k9::assert_equal!(
            Command::parse("ehlo example.com"),
            Command {
                verb: "EHLO".to_string(),
                args: "example.com".to_string()
            }
        );
        k9::assert_equal!(
            Command::parse("Mail FROM:<a@b.com>  SIZE=10"),
            Command {
                verb: "MAIL".to_string(),
                args: "FROM:<a@b.com>  SIZE=10".to_string()
            }
        );
        k9::assert_equal!(
            Command::parse("quit"),
            Command {
                verb: "QUIT".to_string(),
                args: String::new()
            }
        );
        k9::assert_equal!(
            Command::parse(""),
            Command {
                verb: String::new(),
                args: String::new()
            }
        );
        assert!(Command::parse("StartTLS").is("starttls"));
    }

    #[test]
    fn verb_case_does_not_affect_args() {
        for verb in ["auth", "AUTH", "AuTh"] {
            let cmd = Command::parse(&format!("{verb} PLAIN AGFsaWNlAHNlY3JldA=="));
            k9::assert_equal!(cmd.verb, "AUTH");
            k9::assert_equal!(cmd.args, "PLAIN AGFsaWNlAHNlY3JldA==");
        }
    }
}
