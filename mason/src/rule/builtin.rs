// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The built-in rules: the file fallback, the alias rule and the
//! filesystem directory rule.

use std::sync::Arc;

use crate::action::{self, Action};
use crate::context::Context;
use crate::diag::{self, Failed, Record};
use crate::execute;
use crate::search;
use crate::target::{Target, TargetState, types};
use crate::timestamp::Timestamp;

use super::{MatchData, Recipe, Rule, RuleMap, default_recipe, noop_recipe};

/// Register the built-in rules for the perform meta-operation. Called
/// once per context at the global scope.
pub fn register(rules: &mut RuleMap) {
    let file: Arc<dyn Rule> = Arc::new(FileRule);
    let alias: Arc<dyn Rule> = Arc::new(AliasRule);
    let fsdir: Arc<dyn Rule> = Arc::new(FsdirRule);

    for op in [
        action::UPDATE,
        action::CLEAN,
        action::TEST,
        action::INSTALL,
        action::UNINSTALL,
    ] {
        rules.insert(action::PERFORM, op, types::ALIAS, "alias", alias.clone());
        rules.insert(action::PERFORM, op, types::FSDIR, "fsdir", fsdir.clone());
        rules.insert(action::PERFORM, op, types::FILE, "file", file.clone());
    }
}

/// The fallback rule for file targets. For update it matches only if
/// the file already exists; there is nothing it can do to produce one.
/// For every other action it matches unconditionally and does nothing
/// beyond performing the action on the prerequisites.
pub struct FileRule;

impl Rule for FileRule {
    fn matches(
        &self,
        _ctx: &Context,
        action: Action,
        target: &Arc<Target>,
        _hint: &str,
    ) -> Result<Option<MatchData>, Failed> {
        if action.operation() != action::UPDATE {
            return Ok(Some(Box::new(())));
        }

        let mtime = target.load_mtime();

        if mtime == Timestamp::Nonexistent {
            tracing::debug!(target = %target, "no existing file for target");
            return Ok(None);
        }

        Ok(Some(Box::new(())))
    }

    fn apply(&self, ctx: &Context, action: Action, target: &Arc<Target>, _: MatchData) -> Result<Recipe, Failed> {
        // Update triggers an update of the prerequisites, so it would
        // seem natural to also trigger their cleanup. That possibility
        // is rather theoretical: such an update would render this
        // target out of date, which is an error anyway.
        if action.operation() == action::CLEAN {
            return Ok(noop_recipe());
        }

        // No prerequisites means the file is up to date. Quite a few
        // places dealing with predominantly static content rely on
        // this short-circuit.
        if target.prerequisites().is_empty() {
            return Ok(noop_recipe());
        }

        search::search_and_match_prerequisites(ctx, action, target)?;

        if action.operation() == action::UPDATE {
            Ok(Arc::new(file_update))
        } else {
            Ok(default_recipe())
        }
    }
}

/// Make sure the file is not older than any of its prerequisites.
fn file_update(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<TargetState, Failed> {
    let mtime = target.load_mtime();

    if execute::execute_prerequisites_mtime(ctx, action, target, mtime)? {
        return Err(Record::error(format!("no recipe to {}", diag::diag_do(action, target)))
            .with_info(format!("prerequisites of {target} are ahead of it"))
            .fail());
    }

    Ok(TargetState::Unchanged)
}

/// Groups prerequisites under a common name; dir{} derives from it.
pub struct AliasRule;

impl Rule for AliasRule {
    fn matches(&self, _: &Context, _: Action, _: &Arc<Target>, _: &str) -> Result<Option<MatchData>, Failed> {
        Ok(Some(Box::new(())))
    }

    fn apply(&self, ctx: &Context, action: Action, target: &Arc<Target>, _: MatchData) -> Result<Recipe, Failed> {
        // Depend on our own directory (note: not the parent) so that it
        // is automatically created on update and removed on clean.
        search::inject_fsdir(ctx, action, target, false)?;

        search::search_and_match_prerequisites(ctx, action, target)?;
        Ok(default_recipe())
    }
}

/// A directory on the filesystem: created on update, removed on clean
/// (after everything inside it, per the last/back execution mode).
pub struct FsdirRule;

impl Rule for FsdirRule {
    fn matches(&self, _: &Context, _: Action, _: &Arc<Target>, _: &str) -> Result<Option<MatchData>, Failed> {
        Ok(Some(Box::new(())))
    }

    fn apply(&self, ctx: &Context, action: Action, target: &Arc<Target>, _: MatchData) -> Result<Recipe, Failed> {
        // Depend on the parent directory, except for clean: we cannot
        // (and should not) be removing our own parent.
        if action.operation() != action::CLEAN {
            search::inject_fsdir(ctx, action, target, true)?;
        }

        search::search_and_match_prerequisites(ctx, action, target)?;

        match action.operation() {
            action::UPDATE => Ok(Arc::new(fsdir_update)),
            action::CLEAN => Ok(Arc::new(fsdir_clean)),
            _ => Ok(default_recipe()),
        }
    }
}

fn fsdir_update(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<TargetState, Failed> {
    // First update prerequisites (e.g. create parent directories),
    // then this directory.
    let mut state = execute::execute_prerequisites(ctx, action, target)?;

    let dir = &target.key().dir;

    if !dir.exists() {
        diag::echo_command(ctx.verbosity, format!("mkdir {}", dir.display()), format!("mkdir {target}"));

        if !ctx.dry_run {
            fs_err::create_dir_all(dir).map_err(|e| {
                Record::error(format!("unable to create directory {}: {e}", dir.display())).fail()
            })?;
        }

        state = state.merge(TargetState::Changed);
    }

    Ok(state)
}

fn fsdir_clean(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<TargetState, Failed> {
    // The reverse order of update: first delete this directory, then
    // clean prerequisites (e.g. delete parent directories).
    let dir = &target.key().dir;

    let mut state = TargetState::Unchanged;

    if dir.exists() {
        let removed = if ctx.dry_run {
            true
        } else {
            match fs_err::remove_dir(dir) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(_) => {
                    // Not empty (or busy); not fatal, just report it.
                    Record::warn(format!("directory {} is not empty, not removing", dir.display())).emit();
                    false
                }
            }
        };

        if removed {
            diag::echo_command(ctx.verbosity, format!("rmdir {}", dir.display()), format!("rmdir {target}"));
            state = TargetState::Changed;
        }
    }

    Ok(state.merge(execute::reverse_execute_prerequisites(ctx, action, target)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::action::{CLEAN, PERFORM, UPDATE};
    use crate::rule::match_target;
    use crate::target::Decl;

    fn fsdir_target(ctx: &Context, dir: PathBuf) -> Arc<Target> {
        let tt = ctx.target_type(ctx.global_scope(), types::FSDIR).unwrap();
        ctx.targets
            .insert(&tt, dir, PathBuf::new(), String::new(), None, Decl::Real)
            .0
    }

    #[test]
    fn fsdir_update_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::new();

        let target = fsdir_target(&ctx, tmp.path().join("build"));
        let update = Action::new(PERFORM, UPDATE);

        match_target(&ctx, update, &target).unwrap();
        assert_eq!(
            execute::execute(&ctx, update, &target).unwrap(),
            TargetState::Changed
        );
        assert!(tmp.path().join("build").is_dir());
    }

    #[test]
    fn fsdir_update_is_unchanged_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        fs_err::create_dir(tmp.path().join("build")).unwrap();

        let ctx = Context::new();
        let target = fsdir_target(&ctx, tmp.path().join("build"));
        let update = Action::new(PERFORM, UPDATE);

        match_target(&ctx, update, &target).unwrap();
        assert_eq!(
            execute::execute(&ctx, update, &target).unwrap(),
            TargetState::Unchanged
        );
    }

    #[test]
    fn fsdir_update_creates_parent_first() {
        let tmp = tempfile::tempdir().unwrap();

        let mut ctx = Context::new();
        let scope = ctx.insert_scope(tmp.path());
        ctx.scopes_mut().make_root(scope, tmp.path());

        let target = fsdir_target(&ctx, tmp.path().join("a/b"));
        let update = Action::new(PERFORM, UPDATE);

        match_target(&ctx, update, &target).unwrap();
        assert_eq!(
            execute::execute(&ctx, update, &target).unwrap(),
            TargetState::Changed
        );
        assert!(tmp.path().join("a/b").is_dir());

        // Clean removes only the directory itself, never its parent.
        let clean = Action::new(PERFORM, CLEAN);
        match_target(&ctx, clean, &target).unwrap();
        execute::execute(&ctx, clean, &target).unwrap();
        assert!(!tmp.path().join("a/b").exists());
        assert!(tmp.path().join("a").is_dir());
    }

    #[test]
    fn fsdir_clean_removes_empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        fs_err::create_dir(tmp.path().join("build")).unwrap();

        let ctx = Context::new();
        let target = fsdir_target(&ctx, tmp.path().join("build"));
        let clean = Action::new(PERFORM, CLEAN);

        match_target(&ctx, clean, &target).unwrap();
        assert_eq!(
            execute::execute(&ctx, clean, &target).unwrap(),
            TargetState::Changed
        );
        assert!(!tmp.path().join("build").exists());
    }

    #[test]
    fn fsdir_clean_leaves_nonempty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        fs_err::create_dir(tmp.path().join("build")).unwrap();
        fs_err::write(tmp.path().join("build/keep"), b"x").unwrap();

        let ctx = Context::new();
        let target = fsdir_target(&ctx, tmp.path().join("build"));
        let clean = Action::new(PERFORM, CLEAN);

        match_target(&ctx, clean, &target).unwrap();
        assert_eq!(
            execute::execute(&ctx, clean, &target).unwrap(),
            TargetState::Unchanged
        );
        assert!(tmp.path().join("build").exists());
    }

    #[test]
    fn dry_run_reports_without_touching() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::new().with_dry_run(true);

        let target = fsdir_target(&ctx, tmp.path().join("build"));
        let update = Action::new(PERFORM, UPDATE);

        match_target(&ctx, update, &target).unwrap();
        assert_eq!(
            execute::execute(&ctx, update, &target).unwrap(),
            TargetState::Changed
        );
        assert!(!tmp.path().join("build").exists());
    }

    #[test]
    fn file_rule_declines_missing_file_on_update() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::new();

        let tt = ctx.target_type(ctx.global_scope(), types::FILE).unwrap();
        let (target, _) = ctx.targets.insert(
            &tt,
            tmp.path().to_path_buf(),
            PathBuf::new(),
            "ghost".into(),
            None,
            Decl::Real,
        );

        // No rule can update a file that is not there.
        assert!(match_target(&ctx, Action::new(PERFORM, UPDATE), &target).is_err());
    }

    #[test]
    fn file_rule_treats_existing_file_as_up_to_date() {
        let tmp = tempfile::tempdir().unwrap();
        fs_err::write(tmp.path().join("hello.cxx"), b"x").unwrap();

        let ctx = Context::new();
        let tt = ctx.target_type(ctx.global_scope(), types::FILE).unwrap();
        let (target, _) = ctx.targets.insert(
            &tt,
            tmp.path().to_path_buf(),
            PathBuf::new(),
            "hello".into(),
            Some("cxx".into()),
            Decl::Real,
        );

        let update = Action::new(PERFORM, UPDATE);
        match_target(&ctx, update, &target).unwrap();
        assert_eq!(
            execute::execute(&ctx, update, &target).unwrap(),
            TargetState::Unchanged
        );
    }

    #[test]
    fn file_rule_clean_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        fs_err::write(tmp.path().join("source.c"), b"x").unwrap();

        let ctx = Context::new();
        let tt = ctx.target_type(ctx.global_scope(), types::FILE).unwrap();
        let (target, _) = ctx.targets.insert(
            &tt,
            tmp.path().to_path_buf(),
            PathBuf::new(),
            "source".into(),
            Some("c".into()),
            Decl::Real,
        );

        let clean = Action::new(PERFORM, CLEAN);
        match_target(&ctx, clean, &target).unwrap();
        assert_eq!(
            execute::execute(&ctx, clean, &target).unwrap(),
            TargetState::Unchanged
        );

        // Source files are never deleted.
        assert!(tmp.path().join("source.c").exists());
    }
}
