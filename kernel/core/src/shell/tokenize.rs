//! Command-line parsing: `;` / `&&` chains, quoting, `$?` and output redirection.

use crate::consts::{MAX_LINE, MAX_TOKEN_LEN, MAX_TOKENS};
use alloc::vec::Vec;
use core::fmt;
use cupid_api_types::Errno;
use heapless::String;

pub type Token = String<MAX_TOKEN_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellError {
    LineTooLong,
    UnterminatedQuote,
    TooManyTokens,
    TokenTooLong,
    MissingRedirectTarget,
    ExtraRedirect,
    /// `&&` or `;` with nothing on one side.
    EmptyCommand,
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShellError::LineTooLong => "line too long",
            ShellError::UnterminatedQuote => "unterminated quote",
            ShellError::TooManyTokens => "too many arguments",
            ShellError::TokenTooLong => "argument too long",
            ShellError::MissingRedirectTarget => "missing redirection target",
            ShellError::ExtraRedirect => "only one redirection per command",
            ShellError::EmptyCommand => "syntax error near command separator",
        })
    }
}

impl From<ShellError> for Errno {
    fn from(_: ShellError) -> Self {
        Errno::InvalidArgument
    }
}

/// How a command is joined to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// First command, or after `;`.
    Always,
    /// After `&&`: runs only if the previous command succeeded.
    OnSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    Truncate,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub mode: RedirectMode,
    pub target: Token,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub argv: heapless::Vec<Token, MAX_TOKENS>,
    pub redirect: Option<Redirect>,
}

impl Command {
    pub fn name(&self) -> Option<&str> {
        self.argv.first().map(|t| t.as_str())
    }

    pub fn args(&self) -> impl Iterator<Item = &str> {
        self.argv.iter().skip(1).map(|t| t.as_str())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Splits `line` at unquoted `;` and `&&`. The pieces are tokenised one at a time so
/// `$?` sees the status of the command before it.
pub fn split_chain(line: &str) -> Result<Vec<(Connector, &str)>, ShellError> {
    if line.len() > MAX_LINE {
        return Err(ShellError::LineTooLong);
    }
    let mut pieces = Vec::new();
    let mut connector = Connector::Always;
    let mut quote = Quote::None;
    let mut start = 0;
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let separator = match (quote, bytes[i]) {
            (Quote::None, b'\'') => {
                quote = Quote::Single;
                None
            }
            (Quote::None, b'"') => {
                quote = Quote::Double;
                None
            }
            (Quote::Single, b'\'') | (Quote::Double, b'"') => {
                quote = Quote::None;
                None
            }
            (Quote::None, b';') => Some((Connector::Always, 1)),
            (Quote::None, b'&') if bytes.get(i + 1) == Some(&b'&') => Some((Connector::OnSuccess, 2)),
            _ => None,
        };
        match separator {
            Some((next, width)) => {
                let piece = &line[start..i];
                if piece.trim().is_empty() {
                    return Err(ShellError::EmptyCommand);
                }
                pieces.push((connector, piece));
                connector = next;
                i += width;
                start = i;
            }
            None => i += 1,
        }
    }
    if quote != Quote::None {
        return Err(ShellError::UnterminatedQuote);
    }
    let rest = &line[start..];
    if rest.trim().is_empty() {
        // A trailing `;` is allowed, a trailing `&&` is not.
        if connector == Connector::OnSuccess {
            return Err(ShellError::EmptyCommand);
        }
    } else {
        pieces.push((connector, rest));
    }
    Ok(pieces)
}

enum Lexeme {
    Word(Token),
    Redirect(RedirectMode),
}

fn push_char(token: &mut Token, c: char) -> Result<(), ShellError> {
    token.push(c).map_err(|_| ShellError::TokenTooLong)
}

fn push_str(token: &mut Token, s: &str) -> Result<(), ShellError> {
    token.push_str(s).map_err(|_| ShellError::TokenTooLong)
}

fn lex(piece: &str, status: i32) -> Result<Vec<Lexeme>, ShellError> {
    let mut lexemes = Vec::new();
    let mut current = Token::new();
    // Distinguishes `""` (an empty argument) from no argument.
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut status_text: String<12> = String::new();
    let _ = fmt::write(&mut status_text, format_args!("{status}"));

    let mut chars = piece.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Quote::Single, '\'') | (Quote::Double, '"') => quote = Quote::None,
            (Quote::Single, c) => push_char(&mut current, c)?,
            (Quote::None | Quote::Double, '$') if chars.peek() == Some(&'?') => {
                chars.next();
                push_str(&mut current, &status_text)?;
                in_word = true;
            }
            (Quote::Double, c) => push_char(&mut current, c)?,
            (Quote::None, '\'') => {
                quote = Quote::Single;
                in_word = true;
            }
            (Quote::None, '"') => {
                quote = Quote::Double;
                in_word = true;
            }
            (Quote::None, '>') => {
                if in_word {
                    lexemes.push(Lexeme::Word(core::mem::take(&mut current)));
                    in_word = false;
                }
                let mode = if chars.peek() == Some(&'>') {
                    chars.next();
                    RedirectMode::Append
                } else {
                    RedirectMode::Truncate
                };
                lexemes.push(Lexeme::Redirect(mode));
            }
            (Quote::None, c) if c.is_whitespace() => {
                if in_word {
                    lexemes.push(Lexeme::Word(core::mem::take(&mut current)));
                    in_word = false;
                }
            }
            (Quote::None, c) => {
                push_char(&mut current, c)?;
                in_word = true;
            }
        }
    }
    if quote != Quote::None {
        return Err(ShellError::UnterminatedQuote);
    }
    if in_word {
        lexemes.push(Lexeme::Word(current));
    }
    Ok(lexemes)
}

/// Tokenises one command, expanding `$?` to `status`.
pub fn parse_command(piece: &str, status: i32) -> Result<Command, ShellError> {
    let mut command = Command::default();
    let mut lexemes = lex(piece, status)?.into_iter();
    while let Some(lexeme) = lexemes.next() {
        match lexeme {
            Lexeme::Word(word) => command.argv.push(word).map_err(|_| ShellError::TooManyTokens)?,
            Lexeme::Redirect(mode) => {
                if command.redirect.is_some() {
                    return Err(ShellError::ExtraRedirect);
                }
                let Some(Lexeme::Word(target)) = lexemes.next() else {
                    return Err(ShellError::MissingRedirectTarget);
                };
                command.redirect = Some(Redirect { mode, target });
            }
        }
    }
    if command.argv.is_empty() && command.redirect.is_some() {
        return Err(ShellError::EmptyCommand);
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(command: &Command) -> Vec<&str> {
        command.argv.iter().map(|t| t.as_str()).collect()
    }

    #[test]
    fn splits_on_whitespace_and_quotes() {
        let command = parse_command("  echo  'a b'  \"c  d\" e'f'g \"\" ", 0).unwrap();
        assert_eq!(argv(&command), ["echo", "a b", "c  d", "efg", ""]);
        assert!(command.redirect.is_none());
    }

    #[test]
    fn redirections() {
        let command = parse_command("echo hello > /tmp/t", 0).unwrap();
        assert_eq!(argv(&command), ["echo", "hello"]);
        assert_eq!(
            command.redirect,
            Some(Redirect { mode: RedirectMode::Truncate, target: Token::try_from("/tmp/t").unwrap() })
        );

        let command = parse_command("echo hi>>log", 0).unwrap();
        assert_eq!(argv(&command), ["echo", "hi"]);
        assert_eq!(command.redirect.unwrap().mode, RedirectMode::Append);

        let command = parse_command("echo '>' \"a>b\"", 0).unwrap();
        assert_eq!(argv(&command), ["echo", ">", "a>b"]);
        assert!(command.redirect.is_none());
    }

    #[test]
    fn redirection_errors() {
        assert_eq!(parse_command("echo >", 0), Err(ShellError::MissingRedirectTarget));
        assert_eq!(parse_command("echo > a > b", 0), Err(ShellError::ExtraRedirect));
        assert_eq!(parse_command("> a", 0), Err(ShellError::EmptyCommand));
    }

    #[test]
    fn status_expansion() {
        let command = parse_command("echo $? \"[$?]\" '$?' x$?y", 127).unwrap();
        assert_eq!(argv(&command), ["echo", "127", "[127]", "$?", "x127y"]);
        assert_eq!(argv(&parse_command("echo $", 0).unwrap()), ["echo", "$"]);
    }

    #[test]
    fn chains() {
        let chain = split_chain("echo hi > /home/log && echo bye >> /home/log ; cat /home/log").unwrap();
        let connectors: Vec<Connector> = chain.iter().map(|(c, _)| *c).collect();
        assert_eq!(connectors, [Connector::Always, Connector::OnSuccess, Connector::Always]);
        assert_eq!(chain[2].1.trim(), "cat /home/log");

        let quoted = split_chain("echo 'a && b; c'").unwrap();
        assert_eq!(quoted.len(), 1);
        assert_eq!(split_chain("ls;").unwrap().len(), 1);
        assert!(split_chain("").unwrap().is_empty());
        assert_eq!(split_chain("ls &&"), Err(ShellError::EmptyCommand));
        assert_eq!(split_chain("&& ls"), Err(ShellError::EmptyCommand));
        assert_eq!(split_chain("echo 'oops"), Err(ShellError::UnterminatedQuote));
    }

    #[test]
    fn bounds() {
        let many = "a ".repeat(MAX_TOKENS + 1);
        assert_eq!(parse_command(&many, 0), Err(ShellError::TooManyTokens));
        let long = "x".repeat(MAX_TOKEN_LEN + 1);
        assert_eq!(parse_command(&long, 0), Err(ShellError::TokenTooLong));
        let line = "y".repeat(MAX_LINE + 1);
        assert_eq!(split_chain(&line), Err(ShellError::LineTooLong));
        assert_eq!(parse_command("echo \"open", 0), Err(ShellError::UnterminatedQuote));
    }
}
