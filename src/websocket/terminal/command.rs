//! Terminal input allowlist
//!
//! A line is accepted only if its first token is a reserved
//! pseudo-command or the worker program with at least one argument.
//! The unsafe-character check and the allowlist are deliberately two
//! independent predicates: this is a hard allowlist, not a sanitizer,
//! and no attempt is ever made to escape rejected input.

/// The single external program a restricted session may run.
pub const WORKER_PROGRAM: &str = "openclaw";

/// Shell metacharacters that reject a line outright: pipes, redirects,
/// substitution, backgrounding, separators, quoting, escapes.
const UNSAFE_CHARS: &[char] = &[
    '|', '&', ';', '<', '>', '`', '$', '(', ')', '{', '}', '"', '\'', '\\', '*', '?', '~', '#',
];

/// Supervisor-management pseudo-commands handled inside the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoCommand {
    Help,
    Status,
    Start,
    Stop,
    Restart,
    Exit,
}

impl PseudoCommand {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "help" | "?" => Some(Self::Help),
            "status" => Some(Self::Status),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "exit" | "quit" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Outcome of parsing one complete input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// Blank input; reprint the prompt
    Empty,
    /// Handled inside the gateway
    Pseudo(PseudoCommand),
    /// Allowlisted worker invocation (program plus arguments)
    External(Vec<String>),
    /// Refused, with an operator-facing reason
    Rejected(String),
}

/// True if the line contains any shell metacharacter.
pub fn contains_unsafe_chars(line: &str) -> bool {
    line.chars()
        .any(|c| UNSAFE_CHARS.contains(&c) || c.is_control())
}

/// Apply the allowlist to one complete line.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedLine::Empty;
    }

    // The denylist runs first so a pseudo-command followed by an
    // injection attempt ("status; rm -rf /") is still refused.
    if contains_unsafe_chars(trimmed) {
        return ParsedLine::Rejected(
            "input contains shell metacharacters and was not executed".to_string(),
        );
    }

    let mut tokens = trimmed.split_whitespace();
    let first = match tokens.next() {
        Some(t) => t,
        None => return ParsedLine::Empty,
    };

    if let Some(pseudo) = PseudoCommand::parse(first) {
        if tokens.next().is_some() {
            return ParsedLine::Rejected(format!("'{first}' takes no arguments"));
        }
        return ParsedLine::Pseudo(pseudo);
    }

    if first == WORKER_PROGRAM {
        let args: Vec<String> = tokens.map(str::to_string).collect();
        if args.is_empty() {
            return ParsedLine::Rejected(format!(
                "'{WORKER_PROGRAM}' needs a subcommand (try '{WORKER_PROGRAM} status')"
            ));
        }
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(WORKER_PROGRAM.to_string());
        argv.extend(args);
        return ParsedLine::External(argv);
    }

    ParsedLine::Rejected(format!(
        "'{first}' is not an allowed command (type 'help' for the list)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_invocation_accepted() {
        assert_eq!(
            parse_line("openclaw status"),
            ParsedLine::External(vec!["openclaw".into(), "status".into()])
        );
        assert_eq!(
            parse_line("  openclaw devices list  "),
            ParsedLine::External(vec!["openclaw".into(), "devices".into(), "list".into()])
        );
    }

    #[test]
    fn test_metacharacters_rejected() {
        assert!(matches!(
            parse_line("openclaw config; rm -rf /"),
            ParsedLine::Rejected(_)
        ));
        for line in [
            "openclaw status | tee /tmp/x",
            "openclaw status > /tmp/x",
            "openclaw $(whoami)",
            "openclaw status & background",
            "openclaw 'quoted'",
            "openclaw \"quoted\"",
            "openclaw `backtick`",
        ] {
            assert!(
                matches!(parse_line(line), ParsedLine::Rejected(_)),
                "should reject: {line}"
            );
        }
    }

    #[test]
    fn test_pseudo_commands() {
        assert_eq!(parse_line("restart"), ParsedLine::Pseudo(PseudoCommand::Restart));
        assert_eq!(parse_line("status"), ParsedLine::Pseudo(PseudoCommand::Status));
        assert_eq!(parse_line("help"), ParsedLine::Pseudo(PseudoCommand::Help));
        // Pseudo-commands with trailing junk are not silently truncated.
        assert!(matches!(parse_line("restart now"), ParsedLine::Rejected(_)));
    }

    #[test]
    fn test_bare_worker_program_needs_arguments() {
        assert!(matches!(parse_line("openclaw"), ParsedLine::Rejected(_)));
    }

    #[test]
    fn test_unknown_program_rejected() {
        assert!(matches!(parse_line("bash"), ParsedLine::Rejected(_)));
        assert!(matches!(parse_line("rm -rf /"), ParsedLine::Rejected(_)));
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(parse_line(""), ParsedLine::Empty);
        assert_eq!(parse_line("   "), ParsedLine::Empty);
    }

    #[test]
    fn test_unsafe_char_predicate_is_independent() {
        assert!(contains_unsafe_chars("a;b"));
        assert!(contains_unsafe_chars("a\x1b[2Jb"));
        assert!(!contains_unsafe_chars("openclaw status"));
    }
}
