//! Command parsing for the interactive session.

/// One line of interactive input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Translate(String),
    Generate(String),
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl SessionCommand {
    /// Bare text is a translation request.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return SessionCommand::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return SessionCommand::Translate(line.to_string());
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match name {
            "quit" | "exit" => SessionCommand::Quit,
            "help" => SessionCommand::Help,
            "translate" if !arg.is_empty() => SessionCommand::Translate(arg.to_string()),
            "generate" if !arg.is_empty() => SessionCommand::Generate(arg.to_string()),
            "translate" | "generate" => SessionCommand::Empty,
            other => SessionCommand::Unknown(other.to_string()),
        }
    }

    pub const HELP: &'static str = "Commands:\n  \
        /translate <text>   Translate from the session language (default for bare input)\n  \
        /generate <prompt>  Free-form generation\n  \
        /help               Show this message\n  \
        /quit, /exit        Leave the session";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            SessionCommand::parse("/translate good morning"),
            SessionCommand::Translate("good morning".into())
        );
        assert_eq!(
            SessionCommand::parse("/generate  a short poem "),
            SessionCommand::Generate("a short poem".into())
        );
        assert_eq!(SessionCommand::parse("/quit"), SessionCommand::Quit);
        assert_eq!(SessionCommand::parse("/exit"), SessionCommand::Quit);
        assert_eq!(SessionCommand::parse("/help"), SessionCommand::Help);
    }

    #[test]
    fn test_bare_input_translates() {
        assert_eq!(
            SessionCommand::parse("  where is the river "),
            SessionCommand::Translate("where is the river".into())
        );
    }

    #[test]
    fn test_empty_and_unknown() {
        assert_eq!(SessionCommand::parse("   "), SessionCommand::Empty);
        assert_eq!(SessionCommand::parse("/translate"), SessionCommand::Empty);
        assert_eq!(
            SessionCommand::parse("/sing loudly"),
            SessionCommand::Unknown("sing".into())
        );
    }
}
