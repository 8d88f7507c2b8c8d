/// Per-session bounds on the number of commands and on the number of
/// consecutive commands that the engine failed to recognize.
#[derive(Debug, Clone)]
pub struct FloodPolicy {
    max_commands: usize,
    max_unrecognized: usize,
    commands: usize,
    unrecognized: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// The consecutive unrecognized threshold has been exceeded;
    /// the session must be closed.
    TooManyUnrecognized,
}

impl FloodPolicy {
    /// `max_commands` of 0 means unbounded.
    pub fn new(max_commands: usize, max_unrecognized: usize) -> Self {
        Self {
            max_commands,
            max_unrecognized,
            commands: 0,
            unrecognized: 0,
        }
    }

    /// Returns true once the session has used up its command allowance.
    pub fn commands_exhausted(&self) -> bool {
        self.max_commands > 0 && self.commands >= self.max_commands
    }

    pub fn command_received(&mut self) {
        self.commands += 1;
    }

    pub fn recognized(&mut self) {
        self.unrecognized = 0;
    }

    pub fn unrecognized(&mut self) -> Verdict {
        self.unrecognized += 1;
        if self.unrecognized > self.max_unrecognized {
            Verdict::TooManyUnrecognized
        } else {
            Verdict::Continue
        }
    }

    pub fn commands(&self) -> usize {
        self.commands
    }

    pub fn unrecognized_count(&self) -> usize {
        self.unrecognized
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unrecognized_threshold() {
        let mut policy = FloodPolicy::new(0, 3);
        for _ in 0..3 {
            k9::assert_equal!(policy.unrecognized(), Verdict::Continue);
        }
        k9::assert_equal!(policy.unrecognized(), Verdict::TooManyUnrecognized);
    }

    #[test]
    fn recognized_resets_the_streak() {
        let mut policy = FloodPolicy::new(0, 3);
        policy.unrecognized();
        policy.unrecognized();
        policy.recognized();
        k9::assert_equal!(policy.unrecognized_count(), 0);
        for _ in 0..3 {
            k9::assert_equal!(policy.unrecognized(), Verdict::Continue);
        }
    }

    #[test]
    fn command_allowance() {
        let mut policy = FloodPolicy::new(2, 3);
        assert!(!policy.commands_exhausted());
        policy.command_received();
        assert!(!policy.commands_exhausted());
        policy.command_received();
        assert!(policy.commands_exhausted());

        let mut unbounded = FloodPolicy::new(0, 3);
        for _ in 0..10_000 {
            unbounded.command_received();
        }
        assert!(!unbounded.commands_exhausted());
        k9::assert_equal!(unbounded.commands(), 10_000);
    }
}
