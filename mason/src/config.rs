// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration predicates layered over scope variable lookup, and
//! `config.build` persistence.
//!
//! Rules use these to decide "configured?", "specified?", "new?". All
//! of them mark the consulted variable as "to be saved" while the
//! configure meta-operation is current.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::action;
use crate::context::Context;
use crate::scope::ScopeId;
use crate::token::{Lexer, TokenKind};
use crate::variable::{Lookup, Value};

/// Save the variable commented-out, as documentation of the default.
pub const SAVE_COMMENTED: u64 = 0x01;

fn mark_saved(ctx: &Context, name: &str, flags: u64) {
    if ctx.current().meta_operation == action::CONFIGURE {
        ctx.save_variable(ctx.var_pool.intern(name), flags);
    }
}

/// Look up `name`, assigning `default` at `scope` if unset. Returns the
/// effective lookup and whether the value is "new" (defaulted just now,
/// inherited as a default, or changed by an override).
///
/// With `accept_outer` false, a definition inherited from an outer
/// scope is copied into `scope` so the project owns its configuration.
pub fn required(
    ctx: &mut Context,
    scope: ScopeId,
    name: &str,
    default: Value,
    accept_outer: bool,
    save_flags: u64,
) -> (Lookup, bool) {
    mark_saved(ctx, name, save_flags);

    let original = ctx.scopes().lookup(scope, name);

    // An inherited value that was set to a default is still news.
    let mut new = original.extra();

    let (mut lookup, overridden) = ctx.find_override(name, &original);
    new |= overridden;

    if !lookup.defined() {
        let var = ctx.var_pool.intern(name);
        let entry = ctx.scopes_mut().assign(scope, var);
        entry.value = Some(default.clone());

        lookup = Lookup::Defined {
            value: Some(default),
            extra: false,
        };
        new = true;
    } else if !accept_outer && !overridden && ctx.scopes().get(scope).vars.get(name).is_none() {
        // Project the outer definition into this scope.
        let value = lookup.value().cloned();
        let var = ctx.var_pool.intern(name);
        ctx.scopes_mut().assign(scope, var).value = value;
    }

    (lookup, new)
}

/// Look up `name`, assigning the null value if unset, so that
/// "configured as unspecified" can be told apart from "not yet
/// configured".
pub fn optional(ctx: &mut Context, scope: ScopeId, name: &str) -> Lookup {
    mark_saved(ctx, name, 0);

    let lookup = ctx.scopes().lookup(scope, name);
    if lookup.defined() {
        return lookup;
    }

    let var = ctx.var_pool.intern(name);
    ctx.scopes_mut().assign(scope, var);

    Lookup::Defined {
        value: None,
        extra: false,
    }
}

/// Like [`required`] but leaves unset values undefined.
pub fn omitted(ctx: &Context, scope: ScopeId, name: &str) -> (Lookup, bool) {
    let original = ctx.scopes().lookup(scope, name);

    let mut new = original.extra();

    let (lookup, overridden) = ctx.find_override(name, &original);
    new |= overridden;

    if lookup.defined() {
        mark_saved(ctx, name, 0);
    }

    (lookup, new)
}

/// True if any variable under `config.<namespace>.*` other than
/// `*.configured` is set in this or an outer scope.
pub fn specified(ctx: &Context, scope: ScopeId, namespace: &str) -> bool {
    let prefix = format!("config.{namespace}");
    let scopes = ctx.scopes();

    scopes.ancestors(scope).any(|s| {
        scopes
            .get(s)
            .vars
            .find_namespace(&prefix)
            .any(|(name, _)| !name.ends_with(".configured"))
    })
}

/// True if the project was explicitly configured as "not configured"
/// (`config.<namespace>.configured = false`).
pub fn unconfigured(ctx: &Context, scope: ScopeId, namespace: &str) -> bool {
    let name = format!("config.{namespace}.configured");
    mark_saved(ctx, &name, 0);

    let lookup = ctx.scopes().lookup(scope, &name);
    matches!(lookup.value().and_then(Value::as_bool), Some(false))
}

/// Persisted configuration: `build/config.build` under the out root,
/// holding variable assignments in buildfile syntax.
pub fn config_path(ctx: &Context, root: ScopeId) -> PathBuf {
    ctx.scopes().out_path(root).join("build").join("config.build")
}

/// Write every variable marked for saving to `build/config.build`.
/// Values are looked up at the root scope.
pub fn save(ctx: &Context, root: ScopeId) -> Result<(), Error> {
    let path = config_path(ctx, root);

    if let Some(dir) = path.parent() {
        fs_err::create_dir_all(dir)?;
    }

    let mut out = String::from("# Created automatically by the configure meta-operation.\n#\n");

    for (var, flags) in ctx.saved_variables() {
        let lookup = ctx.scopes().lookup(root, &var);

        let Lookup::Defined { value, .. } = lookup else {
            continue;
        };

        let commented = flags & SAVE_COMMENTED != 0;
        let prefix = if commented { "# " } else { "" };

        match value {
            Some(value) => out.push_str(&format!("{prefix}{var} = {value}\n")),
            None => out.push_str(&format!("{prefix}{var} = [null]\n")),
        }
    }

    fs_err::write(&path, out)?;

    Ok(())
}

/// Load `build/config.build` into the root scope, if present. Returns
/// whether a configuration was found.
pub fn load(ctx: &mut Context, root: ScopeId) -> Result<bool, Error> {
    let path = config_path(ctx, root);

    let text = match fs_err::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut lexer = Lexer::new(&text);

    loop {
        let token = lexer.next_token()?;

        let name = match token.kind {
            TokenKind::Eos => break,
            TokenKind::Newline => continue,
            TokenKind::Name(name) => name,
            other => {
                return Err(Error::Unexpected {
                    token: other.to_string(),
                    line: token.line,
                });
            }
        };

        let assign = lexer.next_token()?;
        if !matches!(assign.kind, TokenKind::Assign | TokenKind::Append) {
            return Err(Error::Unexpected {
                token: assign.kind.to_string(),
                line: assign.line,
            });
        }
        let append = assign.kind == TokenKind::Append;

        let mut words = Vec::new();
        loop {
            let token = lexer.next_token()?;
            match token.kind {
                TokenKind::Newline | TokenKind::Eos => break,
                TokenKind::Name(word) => words.push(word),
                other => {
                    return Err(Error::Unexpected {
                        token: other.to_string(),
                        line: token.line,
                    });
                }
            }
        }

        let value = match words.len() {
            0 => None,
            1 if words[0] == "[null]" => None,
            1 => Some(Value::String(words.pop().expect("one word"))),
            _ => Some(Value::Strings(words)),
        };

        let var = ctx.var_pool.intern(&name);
        let entry = if append {
            ctx.scopes_mut().append(root, var)
        } else {
            ctx.scopes_mut().assign(root, var)
        };

        entry.value = match (append, entry.value.take(), value) {
            (true, Some(Value::Strings(mut existing)), Some(Value::Strings(new))) => {
                existing.extend(new);
                Some(Value::Strings(existing))
            }
            (true, Some(Value::Strings(mut existing)), Some(Value::String(new))) => {
                existing.push(new);
                Some(Value::Strings(existing))
            }
            (true, Some(Value::String(existing)), Some(Value::String(new))) => {
                Some(Value::Strings(vec![existing, new]))
            }
            (_, _, value) => value,
        };
    }

    Ok(true)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Lex(#[from] crate::token::Error),
    #[error("line {line}: unexpected {token} in configuration")]
    Unexpected { token: String, line: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use crate::action::{Action, CONFIGURE, PERFORM, UPDATE};

    fn project(dir: &Path) -> (Context, ScopeId) {
        let mut ctx = Context::new();
        let scope = ctx.insert_scope(dir);
        ctx.scopes_mut().make_root(scope, dir);
        (ctx, scope)
    }

    #[test]
    fn required_assigns_default_and_reports_new() {
        let (mut ctx, scope) = project(Path::new("/proj"));

        let (lookup, new) = required(
            &mut ctx,
            scope,
            "config.cxx",
            Value::String("g++".into()),
            false,
            0,
        );

        assert!(new);
        assert_eq!(lookup.value().and_then(Value::as_str), Some("g++"));

        // Second time around the value exists and is no longer new.
        let (lookup, new) = required(
            &mut ctx,
            scope,
            "config.cxx",
            Value::String("c++".into()),
            false,
            0,
        );
        assert!(!new);
        assert_eq!(lookup.value().and_then(Value::as_str), Some("g++"));
    }

    #[test]
    fn required_respects_override() {
        let (mut ctx, scope) = project(Path::new("/proj"));
        ctx.add_override("config.cxx", Value::String("clang++".into()));

        let (lookup, new) = required(
            &mut ctx,
            scope,
            "config.cxx",
            Value::String("g++".into()),
            false,
            0,
        );

        assert!(new);
        assert_eq!(lookup.value().and_then(Value::as_str), Some("clang++"));
    }

    #[test]
    fn optional_distinguishes_null_from_undefined() {
        let (mut ctx, scope) = project(Path::new("/proj"));

        assert!(!ctx.scopes().lookup(scope, "config.import").defined());

        let lookup = optional(&mut ctx, scope, "config.import");
        assert!(lookup.defined());
        assert_eq!(lookup.value(), None);

        // The null sentinel persists.
        assert!(ctx.scopes().lookup(scope, "config.import").defined());
    }

    #[test]
    fn omitted_leaves_unset_undefined() {
        let (ctx, scope) = project(Path::new("/proj"));

        let (lookup, new) = omitted(&ctx, scope, "config.absent");
        assert!(!lookup.defined());
        assert!(!new);
    }

    #[test]
    fn specified_ignores_configured_marker() {
        let (mut ctx, scope) = project(Path::new("/proj"));

        assert!(!specified(&ctx, scope, "cxx"));

        let var = ctx.var_pool.intern("config.cxx.configured");
        ctx.scopes_mut().assign(scope, var).value = Some(Value::Bool(true));
        assert!(!specified(&ctx, scope, "cxx"));

        let var = ctx.var_pool.intern("config.cxx.opts");
        ctx.scopes_mut().assign(scope, var).value = Some(Value::String("-O2".into()));
        assert!(specified(&ctx, scope, "cxx"));
    }

    #[test]
    fn specified_sees_outer_scopes() {
        let (mut ctx, scope) = project(Path::new("/proj"));
        let sub = ctx.insert_scope(Path::new("/proj/sub"));

        let var = ctx.var_pool.intern("config.cli");
        ctx.scopes_mut().assign(scope, var).value = Some(Value::String("cli".into()));

        assert!(specified(&ctx, sub, "cli"));
    }

    #[test]
    fn configure_marks_variables_for_saving() {
        let (mut ctx, scope) = project(Path::new("/proj"));

        // Outside configure nothing is recorded.
        ctx.set_current(Action::new(PERFORM, UPDATE));
        let _ = required(&mut ctx, scope, "config.a", Value::Bool(true), false, 0);
        assert!(ctx.saved_variables().is_empty());

        ctx.set_current(Action::new(CONFIGURE, UPDATE));
        let _ = required(&mut ctx, scope, "config.b", Value::Bool(true), false, 0);
        let _ = optional(&mut ctx, scope, "config.c");

        let saved: Vec<_> = ctx.saved_variables().iter().map(|(v, _)| v.to_string()).collect();
        assert_eq!(saved, vec!["config.b", "config.c"]);
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctx, scope) = project(tmp.path());

        ctx.set_current(Action::new(CONFIGURE, UPDATE));
        let _ = required(&mut ctx, scope, "config.cxx", Value::String("g++".into()), false, 0);
        let _ = required(
            &mut ctx,
            scope,
            "config.cxx.opts",
            Value::Strings(vec!["-O2".into(), "-g".into()]),
            false,
            0,
        );
        let _ = optional(&mut ctx, scope, "config.import");

        save(&ctx, scope).unwrap();

        let text = fs_err::read_to_string(config_path(&ctx, scope)).unwrap();
        assert!(text.contains("config.cxx = g++"));
        assert!(text.contains("config.cxx.opts = -O2 -g"));
        assert!(text.contains("config.import = [null]"));

        // A fresh context loads it back.
        let (mut fresh, fresh_scope) = project(tmp.path());
        assert!(load(&mut fresh, fresh_scope).unwrap());

        assert_eq!(
            fresh.scopes().lookup(fresh_scope, "config.cxx").value().and_then(Value::as_str),
            Some("g++")
        );
        assert_eq!(
            fresh.scopes().lookup(fresh_scope, "config.cxx.opts").value(),
            Some(&Value::Strings(vec!["-O2".into(), "-g".into()]))
        );

        let import = fresh.scopes().lookup(fresh_scope, "config.import");
        assert!(import.defined());
        assert_eq!(import.value(), None);
    }

    #[test]
    fn load_missing_config_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctx, scope) = project(tmp.path());

        assert!(!load(&mut ctx, scope).unwrap());
    }

    #[test]
    fn commented_saves_are_skipped_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctx, scope) = project(tmp.path());

        ctx.set_current(Action::new(CONFIGURE, UPDATE));
        let _ = required(
            &mut ctx,
            scope,
            "config.test",
            Value::Bool(false),
            false,
            SAVE_COMMENTED,
        );
        save(&ctx, scope).unwrap();

        let (mut fresh, fresh_scope) = project(tmp.path());
        assert!(load(&mut fresh, fresh_scope).unwrap());
        assert!(!fresh.scopes().lookup(fresh_scope, "config.test").defined());
    }
}
