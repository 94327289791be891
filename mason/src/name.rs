// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Structured target names as written in buildspecs and prerequisite
//! lists: `[project%][dir/][type{]name[.ext][}]`.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::token::{Lexer, Token, TokenKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Name {
    /// Optional project qualifier (`libhello%lib{hello}`).
    pub project: Option<String>,
    /// Directory component, relative to the referencing scope unless
    /// absolute. A name may be pure directory (`fsdir{build/}`), in
    /// which case `value` is empty.
    pub dir: PathBuf,
    /// Target type tag. `None` means the type is inferred (file for
    /// plain names, dir for directory names).
    pub type_name: Option<String>,
    /// The simple name, without extension.
    pub value: String,
    pub ext: Option<String>,
}

impl Name {
    /// A plain typed name in the current directory.
    pub fn typed(type_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            value: value.into(),
            ..Default::default()
        }
    }

    /// A directory-valued name (`fsdir{build/}`).
    pub fn dir(type_name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.value.is_empty() && !self.dir.as_os_str().is_empty()
    }

    /// Parse a single buildspec name. The whole input must be consumed.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut lexer = Lexer::new(input);
        let name = parse_name(&mut lexer)?;

        let tail = lexer.next_token()?;
        if tail.kind != TokenKind::Eos {
            return Err(Error::Unexpected {
                token: tail.kind.to_string(),
                line: tail.line,
                column: tail.column,
            });
        }

        Ok(name)
    }
}

fn parse_name(lexer: &mut Lexer<'_>) -> Result<Name, Error> {
    let token = lexer.next_token()?;

    let TokenKind::Name(first) = token.kind else {
        return Err(Error::Unexpected {
            token: token.kind.to_string(),
            line: token.line,
            column: token.column,
        });
    };

    let (project, first) = match first.split_once('%') {
        Some((project, rest)) => (Some(project.to_owned()), rest.to_owned()),
        None => (None, first),
    };

    let next = lexer.next_token()?;

    if next.kind != TokenKind::LBrace {
        // An untyped name: `hello.o` or `src/hello.cxx`.
        if next.kind != TokenKind::Eos {
            return Err(Error::Unexpected {
                token: next.kind.to_string(),
                line: next.line,
                column: next.column,
            });
        }

        let (dir, value, ext) = split_components(&first);

        return Ok(Name {
            project,
            dir,
            type_name: None,
            value,
            ext,
        });
    }

    // `first` is `[dir/]type`.
    let (dir, type_name) = match first.rfind('/') {
        Some(i) => (PathBuf::from(&first[..=i]), first[i + 1..].to_owned()),
        None => (PathBuf::new(), first),
    };

    let inner = lexer.next_token()?;
    let TokenKind::Name(inner) = inner.kind else {
        return Err(Error::Unexpected {
            token: inner.kind.to_string(),
            line: inner.line,
            column: inner.column,
        });
    };

    let close = lexer.next_token()?;
    if close.kind != TokenKind::RBrace {
        return Err(Error::Unexpected {
            token: close.kind.to_string(),
            line: close.line,
            column: close.column,
        });
    }

    let (inner_dir, value, ext) = split_components(&inner);
    let dir = if inner_dir.as_os_str().is_empty() {
        dir
    } else if inner_dir.is_absolute() {
        inner_dir
    } else {
        dir.join(inner_dir)
    };

    Ok(Name {
        project,
        dir,
        type_name: Some(type_name),
        value,
        ext,
    })
}

/// Split `sub/hello.cxx` into directory, simple name and extension. A
/// trailing slash means the whole thing is a directory.
fn split_components(raw: &str) -> (PathBuf, String, Option<String>) {
    if raw.ends_with('/') || raw == "." || raw == ".." {
        return (PathBuf::from(raw), String::new(), None);
    }

    let (dir, base) = match raw.rfind('/') {
        Some(i) => (PathBuf::from(&raw[..=i]), &raw[i + 1..]),
        None => (PathBuf::new(), raw),
    };

    // The extension is everything after the last dot, unless the dot is
    // the leading character (hidden files).
    match base.rfind('.') {
        Some(i) if i > 0 => (dir, base[..i].to_owned(), Some(base[i + 1..].to_owned())),
        _ => (dir, base.to_owned(), None),
    }
}

fn fmt_dir(f: &mut fmt::Formatter<'_>, dir: &Path) -> fmt::Result {
    let s = dir.to_string_lossy();
    write!(f, "{s}")?;
    if !s.ends_with('/') {
        write!(f, "/")?;
    }
    Ok(())
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(project) = &self.project {
            write!(f, "{project}%")?;
        }

        match &self.type_name {
            Some(type_name) => {
                write!(f, "{type_name}{{")?;
                if self.is_dir() {
                    fmt_dir(f, &self.dir)?;
                } else {
                    if !self.dir.as_os_str().is_empty() {
                        fmt_dir(f, &self.dir)?;
                    }
                    write!(f, "{}", self.value)?;
                    if let Some(ext) = &self.ext {
                        write!(f, ".{ext}")?;
                    }
                }
                write!(f, "}}")
            }
            None => {
                if !self.dir.as_os_str().is_empty() {
                    fmt_dir(f, &self.dir)?;
                }
                write!(f, "{}", self.value)?;
                if let Some(ext) = &self.ext {
                    write!(f, ".{ext}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] crate::token::Error),
    #[error("{line}:{column}: unexpected {token} in name")]
    Unexpected { token: String, line: u64, column: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_name_with_extension() {
        let name = Name::parse("hello.o").unwrap();
        assert_eq!(name.type_name, None);
        assert_eq!(name.value, "hello");
        assert_eq!(name.ext.as_deref(), Some("o"));
    }

    #[test]
    fn typed_name() {
        let name = Name::parse("file{hello.cxx}").unwrap();
        assert_eq!(name.type_name.as_deref(), Some("file"));
        assert_eq!(name.value, "hello");
        assert_eq!(name.ext.as_deref(), Some("cxx"));
        assert_eq!(name.to_string(), "file{hello.cxx}");
    }

    #[test]
    fn directory_name() {
        let name = Name::parse("fsdir{build/}").unwrap();
        assert_eq!(name.type_name.as_deref(), Some("fsdir"));
        assert!(name.is_dir());
        assert_eq!(name.dir, PathBuf::from("build/"));
        assert_eq!(name.to_string(), "fsdir{build/}");
    }

    #[test]
    fn dir_before_type() {
        let name = Name::parse("src/file{hello.cxx}").unwrap();
        assert_eq!(name.dir, PathBuf::from("src/"));
        assert_eq!(name.type_name.as_deref(), Some("file"));
        assert_eq!(name.value, "hello");
    }

    #[test]
    fn dir_inside_braces() {
        let name = Name::parse("file{sub/hello.cxx}").unwrap();
        assert_eq!(name.dir, PathBuf::from("sub/"));
        assert_eq!(name.value, "hello");
    }

    #[test]
    fn project_qualifier() {
        let name = Name::parse("libhello%file{hello.hxx}").unwrap();
        assert_eq!(name.project.as_deref(), Some("libhello"));
        assert_eq!(name.to_string(), "libhello%file{hello.hxx}");
    }

    #[test]
    fn hidden_file_keeps_leading_dot() {
        let name = Name::parse(".gitignore").unwrap();
        assert_eq!(name.value, ".gitignore");
        assert_eq!(name.ext, None);
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(Name::parse("file{a} b").is_err());
    }

    #[test]
    fn names_equal_iff_all_components_equal() {
        let a = Name::parse("file{hello.cxx}").unwrap();
        let b = Name::parse("file{hello.cxx}").unwrap();
        let c = Name::parse("file{hello.hxx}").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
