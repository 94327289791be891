// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Token abstraction shared by the buildspec parser and the saved
//! configuration loader.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Eos,
    Newline,
    /// `{`
    LBrace,
    /// `}`
    RBrace,
    /// `:`
    Colon,
    /// `=`
    Assign,
    /// `+=`
    Append,
    Name(String),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Eos => f.write_str("<end of input>"),
            TokenKind::Newline => f.write_str("<newline>"),
            TokenKind::LBrace => f.write_str("{"),
            TokenKind::RBrace => f.write_str("}"),
            TokenKind::Colon => f.write_str(":"),
            TokenKind::Assign => f.write_str("="),
            TokenKind::Append => f.write_str("+="),
            TokenKind::Name(n) => f.write_str(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u64,
    pub column: u64,
}

/// After `=` or `+=` the rest of the line is a value: `:`, `=` and `+`
/// lose their special meaning so that values don't need quoting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Value,
}

pub struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    mode: Mode,
    line: u64,
    column: u64,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().peekable(),
            mode: Mode::Normal,
            line: 1,
            column: 1,
        }
    }

    pub fn input(&self) -> &'a str {
        self.input
    }

    fn get(&mut self) -> Option<char> {
        let c = self.chars.next()?;

        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }

        Some(c)
    }

    fn skip_spaces_and_comments(&mut self) {
        while let Some(&c) = self.chars.peek() {
            match c {
                ' ' | '\t' => {
                    self.get();
                }
                '#' => {
                    // Comment runs to the end of the line; the newline
                    // itself is still a token.
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.get();
                    }
                }
                _ => break,
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, Error> {
        self.skip_spaces_and_comments();

        let (line, column) = (self.line, self.column);

        let token = |kind| Token { kind, line, column };

        let Some(&c) = self.chars.peek() else {
            return Ok(token(TokenKind::Eos));
        };

        match c {
            '\n' => {
                self.get();
                // Restore the normal mode at the end of the line.
                self.mode = Mode::Normal;
                return Ok(token(TokenKind::Newline));
            }
            '{' => {
                self.get();
                return Ok(token(TokenKind::LBrace));
            }
            '}' => {
                self.get();
                return Ok(token(TokenKind::RBrace));
            }
            _ => {}
        }

        if self.mode == Mode::Normal {
            match c {
                ':' => {
                    self.get();
                    return Ok(token(TokenKind::Colon));
                }
                '=' => {
                    self.get();
                    self.mode = Mode::Value;
                    return Ok(token(TokenKind::Assign));
                }
                '+' => {
                    self.get();
                    if self.chars.peek() != Some(&'=') {
                        return Err(Error::ExpectedAssign { line, column });
                    }
                    self.get();
                    self.mode = Mode::Value;
                    return Ok(token(TokenKind::Append));
                }
                _ => {}
            }
        }

        self.name(line, column).map(|kind| token(kind))
    }

    fn name(&mut self, line: u64, column: u64) -> Result<TokenKind, Error> {
        let mut name = String::new();

        while let Some(&c) = self.chars.peek() {
            let separator = match self.mode {
                Mode::Normal => matches!(c, ':' | '=' | '+'),
                Mode::Value => false,
            };

            if c.is_whitespace() || c == '#' || c == '{' || c == '}' || separator {
                break;
            }

            if c == '\\' {
                self.get();
                let Some(escaped) = self.get() else {
                    return Err(Error::UnterminatedEscape { line, column });
                };
                name.push(escaped);
                continue;
            }

            self.get();
            name.push(c);
        }

        Ok(TokenKind::Name(name))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{line}:{column}: expected = after +")]
    ExpectedAssign { line: u64, column: u64 },
    #[error("{line}:{column}: unterminated escape sequence")]
    UnterminatedEscape { line: u64, column: u64 },
}
