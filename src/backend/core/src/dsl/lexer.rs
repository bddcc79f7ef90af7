//! Tokenizer for DSL-v2 expressions.

use std::fmt;

/// A lexical token with its byte offset, for error reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// A bare identifier segment (no dots)
    Ident(String),
    /// A double-quoted string
    Str(String),
    Int(i64),
    Float(f64),
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "identifier `{}`", s),
            Self::Str(s) => write!(f, "string {:?}", s),
            Self::Int(i) => write!(f, "integer {}", i),
            Self::Float(v) => write!(f, "number {}", v),
            Self::LBrace => write!(f, "`{{`"),
            Self::RBrace => write!(f, "`}}`"),
            Self::LParen => write!(f, "`(`"),
            Self::RParen => write!(f, "`)`"),
            Self::LBracket => write!(f, "`[`"),
            Self::RBracket => write!(f, "`]`"),
            Self::Dot => write!(f, "`.`"),
            Self::Comma => write!(f, "`,`"),
            Self::EqEq => write!(f, "`==`"),
            Self::NotEq => write!(f, "`!=`"),
            Self::Lt => write!(f, "`<`"),
            Self::Le => write!(f, "`<=`"),
            Self::Gt => write!(f, "`>`"),
            Self::Ge => write!(f, "`>=`"),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// Lexing failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LexError {
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("malformed number at offset {offset}")]
    MalformedNumber { offset: usize },
}

/// Tokenize an expression. Always ends with an `Eof` token.
pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
            }
            b'{' => {
                tokens.push(Token { kind: TokenKind::LBrace, offset: i });
                i += 1;
            }
            b'}' => {
                tokens.push(Token { kind: TokenKind::RBrace, offset: i });
                i += 1;
            }
            b'(' => {
                tokens.push(Token { kind: TokenKind::LParen, offset: i });
                i += 1;
            }
            b')' => {
                tokens.push(Token { kind: TokenKind::RParen, offset: i });
                i += 1;
            }
            b'[' => {
                tokens.push(Token { kind: TokenKind::LBracket, offset: i });
                i += 1;
            }
            b']' => {
                tokens.push(Token { kind: TokenKind::RBracket, offset: i });
                i += 1;
            }
            b'.' => {
                tokens.push(Token { kind: TokenKind::Dot, offset: i });
                i += 1;
            }
            b',' => {
                tokens.push(Token { kind: TokenKind::Comma, offset: i });
                i += 1;
            }
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::EqEq, offset: i });
                    i += 2;
                } else {
                    return Err(LexError::UnexpectedChar { ch: '=', offset: i });
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::NotEq, offset: i });
                    i += 2;
                } else {
                    return Err(LexError::UnexpectedChar { ch: '!', offset: i });
                }
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Le, offset: i });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, offset: i });
                    i += 1;
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { kind: TokenKind::Ge, offset: i });
                    i += 2;
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, offset: i });
                    i += 1;
                }
            }
            b'"' => {
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match bytes.get(i) {
                        None => return Err(LexError::UnterminatedString { offset: start }),
                        Some(b'"') => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            match bytes.get(i + 1) {
                                Some(b'"') => s.push('"'),
                                Some(b'\\') => s.push('\\'),
                                Some(&other) => s.push(other as char),
                                None => {
                                    return Err(LexError::UnterminatedString { offset: start })
                                }
                            }
                            i += 2;
                        }
                        Some(&other) => {
                            s.push(other as char);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(s),
                    offset: start,
                });
            }
            b'0'..=b'9' | b'-' => {
                let start = i;
                if b == b'-' {
                    i += 1;
                }
                let mut saw_digit = false;
                let mut saw_dot = false;
                while let Some(&c) = bytes.get(i) {
                    match c {
                        b'0'..=b'9' => {
                            saw_digit = true;
                            i += 1;
                        }
                        // A dot is part of the number only when a digit follows;
                        // otherwise it belongs to a dotted name.
                        b'.' if !saw_dot
                            && matches!(bytes.get(i + 1), Some(b'0'..=b'9')) =>
                        {
                            saw_dot = true;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                if !saw_digit {
                    return Err(LexError::MalformedNumber { offset: start });
                }
                let text = &input[start..i];
                let kind = if saw_dot {
                    TokenKind::Float(
                        text.parse()
                            .map_err(|_| LexError::MalformedNumber { offset: start })?,
                    )
                } else {
                    TokenKind::Int(
                        text.parse()
                            .map_err(|_| LexError::MalformedNumber { offset: start })?,
                    )
                };
                tokens.push(Token { kind, offset: start });
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                let start = i;
                while let Some(&c) = bytes.get(i) {
                    if c.is_ascii_alphanumeric() || c == b'_' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(input[start..i].to_string()),
                    offset: start,
                });
            }
            other => {
                return Err(LexError::UnexpectedChar {
                    ch: other as char,
                    offset: i,
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: input.len(),
    });
    Ok(tokens)
}
