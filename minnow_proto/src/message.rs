//! The line codec: `[:source] COMMAND [param ...] [:trailing]`.

use thiserror::Error;

/// Maximum encoded length of a single message, including the trailing CRLF.
pub const MAX_LINE_LEN: usize = 512;

/// Maximum number of middle parameters before the remainder of the line is
/// treated as trailing.
const MAX_PARAMS: usize = 15;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("message exceeds {MAX_LINE_LEN} bytes")]
    TooLong,
    #[error("source with no command")]
    Truncated,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("parameter not encodable: {0:?}")]
    InvalidParam(String),
}

/// A tokenised protocol message.
///
/// Commands are uppercased at parse time; sources and parameters are kept
/// byte-for-byte as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            source: None,
            command: command.into(),
            params,
        }
    }

    pub fn with_source(
        source: impl Into<String>,
        command: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        Self {
            source: Some(source.into()),
            command: command.into(),
            params,
        }
    }

    /// Whether the command is a three-digit numeric.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }

    /// Parse a single line, without its CRLF terminator.
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.len() > MAX_LINE_LEN - 2 {
            return Err(MessageError::TooLong);
        }

        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(MessageError::Empty);
        }

        let source = if let Some(after) = rest.strip_prefix(':') {
            let offset = after.find(' ').ok_or(MessageError::Truncated)?;
            let source = &after[..offset];
            if source.is_empty() {
                return Err(MessageError::Truncated);
            }
            rest = after[offset..].trim_start_matches(' ');
            Some(source.to_string())
        } else {
            None
        };

        if rest.is_empty() {
            return Err(MessageError::Truncated);
        }

        let command = match rest.find(' ') {
            Some(offset) => {
                let command = &rest[..offset];
                rest = rest[offset..].trim_start_matches(' ');
                command
            }
            None => {
                let command = rest;
                rest = "";
                command
            }
        };

        if !is_valid_command(command) {
            return Err(MessageError::InvalidCommand(command.to_string()));
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            if params.len() == MAX_PARAMS - 1 {
                // The 15th parameter swallows the rest of the line.
                params.push(rest.to_string());
                break;
            }
            match rest.find(' ') {
                Some(offset) => {
                    params.push(rest[..offset].to_string());
                    rest = rest[offset..].trim_start_matches(' ');
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Self {
            source,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Serialise to a wire line, including the CRLF terminator.
    ///
    /// A final parameter that is empty, contains a space, or begins with a
    /// colon is emitted as trailing. Any other parameter with those
    /// properties cannot be represented and is an error.
    pub fn encode(&self) -> Result<String, MessageError> {
        let mut out = String::with_capacity(64);

        if let Some(source) = &self.source {
            out.push(':');
            out.push_str(source);
            out.push(' ');
        }
        out.push_str(&self.command);

        for (i, param) in self.params.iter().enumerate() {
            if param.contains('\r') || param.contains('\n') {
                return Err(MessageError::InvalidParam(param.clone()));
            }
            let needs_trailing =
                param.is_empty() || param.starts_with(':') || param.contains(' ');
            let last = i + 1 == self.params.len();

            out.push(' ');
            if needs_trailing {
                if !last {
                    return Err(MessageError::InvalidParam(param.clone()));
                }
                out.push(':');
            }
            out.push_str(param);
        }

        out.push_str("\r\n");
        if out.len() > MAX_LINE_LEN {
            return Err(MessageError::TooLong);
        }
        Ok(out)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(source) = &self.source {
            write!(f, ":{} ", source)?;
        }
        write!(f, "{}", self.command)?;
        for param in &self.params {
            write!(f, " {}", param)?;
        }
        Ok(())
    }
}

fn is_valid_command(command: &str) -> bool {
    if command.is_empty() {
        return false;
    }
    command.bytes().all(|b| b.is_ascii_alphabetic())
        || (command.len() == 3 && command.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_params() {
        let msg = Message::parse("QUIT").unwrap();
        assert_eq!(msg.command, "QUIT");
        assert!(msg.source.is_none());
        assert!(msg.params.is_empty());
    }

    #[test]
    fn source_and_trailing() {
        let msg = Message::parse(":8ZZ UID will 1 1475024621 +i will h. 0 8ZZAAAAAB :will f")
            .unwrap();
        assert_eq!(msg.source.as_deref(), Some("8ZZ"));
        assert_eq!(msg.command, "UID");
        assert_eq!(msg.params.len(), 9);
        assert_eq!(msg.params[8], "will f");
    }

    #[test]
    fn command_uppercased() {
        let msg = Message::parse("privmsg #x :hi").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, &["#x", "hi"]);
    }

    #[test]
    fn empty_trailing() {
        let msg = Message::parse("SJOIN 1 #x +ns :").unwrap();
        assert_eq!(msg.params, &["1", "#x", "+ns", ""]);
    }

    #[test]
    fn colon_inside_trailing() {
        let msg = Message::parse("PRIVMSG #x ::-)").unwrap();
        assert_eq!(msg.params, &["#x", ":-)"]);
    }

    #[test]
    fn double_space() {
        let msg = Message::parse("CMD a  b").unwrap();
        assert_eq!(msg.params, &["a", "b"]);
    }

    #[test]
    fn numeric_command() {
        let msg = Message::parse(":srv 001 nick :Welcome").unwrap();
        assert!(msg.is_numeric());
        assert_eq!(msg.command, "001");
    }

    #[test]
    fn bad_command() {
        assert!(matches!(
            Message::parse("12 a"),
            Err(MessageError::InvalidCommand(_))
        ));
        assert!(matches!(
            Message::parse("WH0IS a"),
            Err(MessageError::InvalidCommand(_))
        ));
    }

    #[test]
    fn empty_line() {
        assert_eq!(Message::parse(""), Err(MessageError::Empty));
        assert_eq!(Message::parse("   "), Err(MessageError::Empty));
    }

    #[test]
    fn source_without_command() {
        assert_eq!(Message::parse(":onlyprefix"), Err(MessageError::Truncated));
    }

    #[test]
    fn too_long_rejected() {
        let line = format!("PRIVMSG #x :{}", "a".repeat(600));
        assert_eq!(Message::parse(&line), Err(MessageError::TooLong));
    }

    #[test]
    fn param_cap_collapses_to_trailing() {
        let middles = (0..16).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let msg = Message::parse(&format!("CMD {}", middles)).unwrap();
        assert_eq!(msg.params.len(), 15);
        assert_eq!(msg.params[14], "14 15");
    }

    #[test]
    fn encode_round_trip() {
        let msg = Message::with_source(
            "8ZZ",
            "SJOIN",
            vec!["500".into(), "#x".into(), "+ns".into(), "1AAAAAAAA 1AAAAAAAB".into()],
        );
        let line = msg.encode().unwrap();
        assert_eq!(line, ":8ZZ SJOIN 500 #x +ns :1AAAAAAAA 1AAAAAAAB\r\n");
        assert_eq!(Message::parse(&line).unwrap(), msg);
    }

    #[test]
    fn encode_empty_last_param() {
        let msg = Message::new("SJOIN", vec!["1".into(), "#x".into(), "+ns".into(), "".into()]);
        assert_eq!(msg.encode().unwrap(), "SJOIN 1 #x +ns :\r\n");
    }

    #[test]
    fn encode_rejects_inner_space() {
        let msg = Message::new("CMD", vec!["a b".into(), "c".into()]);
        assert!(matches!(msg.encode(), Err(MessageError::InvalidParam(_))));
    }

    #[test]
    fn encode_rejects_oversize() {
        let msg = Message::new("PRIVMSG", vec!["#x".into(), "a".repeat(520)]);
        assert_eq!(msg.encode(), Err(MessageError::TooLong));
    }
}
