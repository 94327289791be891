// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The execute engine: run recipes with per-(action, target)
//! memoization, dependency-count bookkeeping and mtime-based
//! up-to-date logic.

use std::{sync::Arc, sync::atomic::Ordering, thread};

use crate::action::Action;
use crate::context::Context;
use crate::diag::{self, Failed, Record};
use crate::target::{Target, TargetState};
use crate::timestamp::Timestamp;

/// Execute `target` for `action`.
///
/// The recipe runs at most once: `unchanged` and `changed` results are
/// memoized, a `failed` state raises the sentinel, and concurrent
/// requests block until the first invocation completes. A `postponed`
/// target is left alone until the driver's post pass re-examines it
/// through [`execute_postponed`].
pub fn execute(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<TargetState, Failed> {
    execute_impl(ctx, action, target, false)
}

/// Re-examine a postponed target; its recipe must now produce a final
/// state.
pub fn execute_postponed(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<TargetState, Failed> {
    execute_impl(ctx, action, target, true)
}

fn execute_impl(
    ctx: &Context,
    action: Action,
    target: &Arc<Target>,
    retry_postponed: bool,
) -> Result<TargetState, Failed> {
    let slot = target.opstate(action);

    let recipe = {
        let mut data = slot.lock();

        if data.epoch != ctx.epoch() || data.wire != action.wire() {
            drop(data);
            return Err(Record::error(format!(
                "target {target} executed without being matched for {action}"
            ))
            .fail());
        }

        loop {
            match data.state {
                TargetState::Unchanged | TargetState::Changed => return Ok(data.state),
                TargetState::Failed if data.busy.is_none() => return Err(Failed),
                TargetState::Postponed if !retry_postponed && data.busy.is_none() => {
                    return Ok(TargetState::Postponed);
                }
                _ => {}
            }

            match data.busy {
                Some(tid) if tid == thread::current().id() => {
                    drop(data);
                    return Err(Record::error(format!(
                        "dependency cycle detected involving target {target}"
                    ))
                    .fail());
                }
                Some(_) => {
                    // Another thread is running the recipe; observe its
                    // cached result once it finishes.
                    data = slot.cond.wait(data).expect("target state poisoned");
                }
                None => break,
            }
        }

        let Some(recipe) = data.recipe.clone() else {
            drop(data);
            return Err(Record::error(format!(
                "target {target} executed without being matched for {action}"
            ))
            .fail());
        };

        data.busy = Some(thread::current().id());

        // Pre-set to failed so that an early return or panic inside the
        // recipe leaves a consistent state.
        data.state = TargetState::Failed;

        recipe
    };

    tracing::trace!(target = %target, action = %action, "executing");

    let result = recipe(ctx, action, target);

    let mut data = slot.lock();
    data.busy = None;

    let out = match result {
        Ok(TargetState::Postponed) => {
            assert!(
                !data.postponed_once,
                "target {target} postponed a second time"
            );
            data.postponed_once = true;
            data.state = TargetState::Postponed;
            Ok(TargetState::Postponed)
        }
        Ok(state @ (TargetState::Unchanged | TargetState::Changed)) => {
            data.state = state;
            ctx.dependency_count.fetch_sub(1, Ordering::AcqRel);
            Ok(state)
        }
        Ok(other) => {
            unreachable!("recipe for {target} returned {other}")
        }
        Err(Failed) => {
            data.state = TargetState::Failed;
            Record::info(format!("while {}", diag::diag_doing(action, target))).emit();
            Err(Failed)
        }
    };

    drop(data);
    slot.cond.notify_all();

    out
}

/// Collect the resolved per-action prerequisite targets, skipping the
/// ignored ones.
fn prerequisite_targets(action: Action, target: &Target) -> Vec<Arc<Target>> {
    target
        .opstate(action)
        .lock()
        .prerequisite_targets
        .iter()
        .flatten()
        .cloned()
        .collect()
}

/// Execute prerequisites in order; `changed` if any changed.
pub fn execute_prerequisites(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<TargetState, Failed> {
    let mut state = TargetState::Unchanged;

    for prerequisite in prerequisite_targets(action, target) {
        if execute(ctx, action, &prerequisite)? == TargetState::Changed {
            state = TargetState::Changed;
        }
    }

    Ok(state)
}

/// Execute prerequisites in reverse order; used by destructive
/// operations to honor the last/back execution mode.
pub fn reverse_execute_prerequisites(
    ctx: &Context,
    action: Action,
    target: &Arc<Target>,
) -> Result<TargetState, Failed> {
    let mut state = TargetState::Unchanged;

    for prerequisite in prerequisite_targets(action, target).into_iter().rev() {
        if execute(ctx, action, &prerequisite)? == TargetState::Changed {
            state = TargetState::Changed;
        }
    }

    Ok(state)
}

/// Execute prerequisites and decide whether a target with modification
/// time `mtime` is out of date.
///
/// Returns true if the target does not exist or some prerequisite is
/// newer. Equal mtimes count as newer only when the prerequisite was
/// changed in this run; that is the only reliable signal on
/// filesystems with coarse mtime resolution.
pub fn execute_prerequisites_mtime(
    ctx: &Context,
    action: Action,
    target: &Arc<Target>,
    mtime: Timestamp,
) -> Result<bool, Failed> {
    let mut out_of_date = mtime.is_nonexistent();

    for prerequisite in prerequisite_targets(action, target) {
        let state = execute(ctx, action, &prerequisite)?;

        if out_of_date {
            continue;
        }

        if prerequisite.target_type().file_based {
            let prereq_mtime = prerequisite.load_mtime();

            if prereq_mtime.newer_than(&mtime)
                || (prereq_mtime == mtime && state == TargetState::Changed)
            {
                out_of_date = true;
            }
        } else if state == TargetState::Changed {
            // Not mtime-based: assume newer if it changed.
            out_of_date = true;
        }
    }

    Ok(out_of_date)
}

/// Remove a file target and clean its prerequisites, in the reverse
/// order of update: the file first, the prerequisites after.
pub fn perform_clean_file(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<TargetState, Failed> {
    let path = target.path().to_path_buf();

    let removed = if ctx.dry_run {
        target.load_mtime() != Timestamp::Nonexistent
    } else {
        match fs_err::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                diag::echo_command(ctx.verbosity.max(1), format!("rm {}", path.display()), format!("rm {target}"));
                return Err(Record::error(format!("unable to delete file {}: {e}", path.display())).fail());
            }
        }
    };

    // Don't print the command if there was nothing to delete, just like
    // an up-to-date target's update command is not printed.
    if removed {
        diag::echo_command(ctx.verbosity, format!("rm {}", path.display()), format!("rm {target}"));
    }

    // Update the timestamp in case there are operations after us that
    // could use the information.
    target.set_mtime(Timestamp::Nonexistent);

    let mut state = if removed { TargetState::Changed } else { TargetState::Unchanged };

    if !target.prerequisites().is_empty() || !target.opstate(action).lock().prerequisite_targets.is_empty() {
        state = state.merge(reverse_execute_prerequisites(ctx, action, target)?);
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use crate::action::{CLEAN, PERFORM, UPDATE};
    use crate::rule::{self, MatchData, Recipe, Rule};
    use crate::target::{Decl, types};

    /// A rule handing out a fixed recipe.
    struct RecipeRule(Recipe);

    impl Rule for RecipeRule {
        fn matches(
            &self,
            _: &Context,
            _: Action,
            _: &Arc<Target>,
            _: &str,
        ) -> Result<Option<MatchData>, Failed> {
            Ok(Some(Box::new(())))
        }

        fn apply(&self, ctx: &Context, action: Action, target: &Arc<Target>, _: MatchData) -> Result<Recipe, Failed> {
            crate::search::search_and_match_prerequisites(ctx, action, target)?;
            Ok(self.0.clone())
        }
    }

    fn context() -> Context {
        let mut ctx = Context::new();
        ctx.insert_scope(Path::new("/proj"));
        ctx
    }

    fn make_target(ctx: &Context, name: &str) -> Arc<Target> {
        let tt = ctx.target_type(ctx.global_scope(), types::TARGET).unwrap();
        ctx.targets
            .insert(&tt, "/proj".into(), PathBuf::new(), name.into(), None, Decl::Real)
            .0
    }

    fn matched(ctx: &mut Context, name: &str, recipe: Recipe) -> Arc<Target> {
        let target = make_target(ctx, name);
        ctx.insert_rule(
            ctx.global_scope(),
            PERFORM,
            UPDATE,
            types::TARGET,
            format!("test.{name}"),
            Arc::new(RecipeRule(recipe)),
        );
        target
    }

    #[test]
    fn recipe_runs_once_and_memoizes() {
        let mut ctx = context();
        let calls = Arc::new(AtomicUsize::new(0));

        let recipe: Recipe = {
            let calls = calls.clone();
            Arc::new(move |_, _, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(TargetState::Changed)
            })
        };

        let target = matched(&mut ctx, "a", recipe);
        let action = Action::new(PERFORM, UPDATE);
        rule::match_target(&ctx, action, &target).unwrap();

        assert_eq!(execute(&ctx, action, &target).unwrap(), TargetState::Changed);
        assert_eq!(execute(&ctx, action, &target).unwrap(), TargetState::Changed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.dependency_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_recipe_latches_and_propagates() {
        let mut ctx = context();

        let recipe: Recipe = Arc::new(|_, _, _| Err(Failed));
        let target = matched(&mut ctx, "bad", recipe);
        let action = Action::new(PERFORM, UPDATE);
        rule::match_target(&ctx, action, &target).unwrap();

        assert!(execute(&ctx, action, &target).is_err());
        assert_eq!(target.state(action), TargetState::Failed);

        // Dependents observe the sentinel without re-running anything.
        assert!(execute(&ctx, action, &target).is_err());
    }

    #[test]
    fn postponed_then_resolved() {
        let mut ctx = context();
        let calls = Arc::new(AtomicUsize::new(0));

        let recipe: Recipe = {
            let calls = calls.clone();
            Arc::new(move |_, _, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(TargetState::Postponed)
                } else {
                    Ok(TargetState::Changed)
                }
            })
        };

        let target = matched(&mut ctx, "later", recipe);
        let action = Action::new(PERFORM, UPDATE);
        rule::match_target(&ctx, action, &target).unwrap();

        assert_eq!(execute(&ctx, action, &target).unwrap(), TargetState::Postponed);
        // The main pass does not re-invoke the recipe.
        assert_eq!(execute(&ctx, action, &target).unwrap(), TargetState::Postponed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The post pass does.
        assert_eq!(execute_postponed(&ctx, action, &target).unwrap(), TargetState::Changed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(target.state(action), TargetState::Changed);
    }

    #[test]
    fn state_transitions_are_monotone() {
        let mut ctx = context();

        let recipe: Recipe = Arc::new(|_, _, _| Ok(TargetState::Unchanged));
        let target = matched(&mut ctx, "mono", recipe);
        let action = Action::new(PERFORM, UPDATE);

        assert_eq!(target.state(action), TargetState::Unknown);
        rule::match_target(&ctx, action, &target).unwrap();
        assert_eq!(target.state(action), TargetState::Unknown);

        execute(&ctx, action, &target).unwrap();
        assert_eq!(target.state(action), TargetState::Unchanged);
    }

    #[test]
    fn unmatched_execute_fails() {
        let ctx = context();
        let target = make_target(&ctx, "loose");

        assert!(execute(&ctx, Action::new(PERFORM, UPDATE), &target).is_err());
    }

    #[test]
    fn reverse_execution_order() {
        let mut ctx = context();
        let order = Arc::new(Mutex::new(Vec::new()));

        let tracking_recipe = |tag: &'static str, order: Arc<Mutex<Vec<&'static str>>>| -> Recipe {
            Arc::new(move |_, _, _| {
                order.lock().unwrap().push(tag);
                Ok(TargetState::Changed)
            })
        };

        let a = matched(&mut ctx, "a", tracking_recipe("a", order.clone()));
        let b = matched(&mut ctx, "b", tracking_recipe("b", order.clone()));
        let parent = make_target(&ctx, "parent");

        // Two always-matching rules are registered, so disambiguate by
        // hint.
        let action = Action::new(PERFORM, UPDATE);
        rule::match_target_hinted(&ctx, action, &a, "test.a").unwrap();
        rule::match_target_hinted(&ctx, action, &b, "test.b").unwrap();

        // Stuff resolved prerequisites straight into the parent's slot.
        {
            let slot = parent.opstate(action);
            let mut data = slot.lock();
            data.prerequisite_targets = vec![Some(a.clone()), Some(b.clone())];
        }

        reverse_execute_prerequisites(&ctx, action, &parent).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn mtime_freshness_tie_break() {
        let mut ctx = context();
        let dir = tempfile::tempdir().unwrap();

        let source = dir.path().join("input");
        fs_err::write(&source, b"data").unwrap();
        let stamp = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&source, stamp).unwrap();

        let file_tt = ctx.target_type(ctx.global_scope(), types::FILE).unwrap();
        let (prereq, _) = ctx.targets.insert(
            &file_tt,
            dir.path().to_path_buf(),
            PathBuf::new(),
            "input".into(),
            None,
            Decl::Real,
        );

        // Unchanged recipe for the prerequisite.
        ctx.insert_rule(
            ctx.global_scope(),
            PERFORM,
            UPDATE,
            types::FILE,
            "test.source",
            Arc::new(RecipeRule(rule::noop_recipe())),
        );

        // The builtin file rule also matches an existing file, so pick
        // ours by hint.
        let action = Action::new(PERFORM, UPDATE);
        rule::match_target_hinted(&ctx, action, &prereq, "test.source").unwrap();

        let parent = make_target(&ctx, "out");
        parent.opstate(action).lock().prerequisite_targets = vec![Some(prereq.clone())];

        let prereq_mtime = prereq.load_mtime();

        // Nonexistent target: always out of date.
        assert!(execute_prerequisites_mtime(&ctx, action, &parent, Timestamp::Nonexistent).unwrap());

        // Target newer than the prerequisite: up to date.
        let newer = Timestamp::At(std::time::SystemTime::now());
        assert!(!execute_prerequisites_mtime(&ctx, action, &parent, newer).unwrap());

        // Equal mtimes with an unchanged prerequisite: up to date.
        assert!(!execute_prerequisites_mtime(&ctx, action, &parent, prereq_mtime).unwrap());
    }

    #[test]
    fn clean_file_removes_then_cleans_prerequisites() {
        let mut ctx = context();
        let dir = tempfile::tempdir().unwrap();

        let out = dir.path().join("product");
        fs_err::write(&out, b"built").unwrap();

        let file_tt = ctx.target_type(ctx.global_scope(), types::FILE).unwrap();
        let (target, _) = ctx.targets.insert(
            &file_tt,
            dir.path().to_path_buf(),
            PathBuf::new(),
            "product".into(),
            None,
            Decl::Real,
        );

        let action = Action::new(PERFORM, CLEAN);

        assert_eq!(
            perform_clean_file(&ctx, action, &target).unwrap(),
            TargetState::Changed
        );
        assert!(!out.exists());
        assert_eq!(target.mtime(), Timestamp::Nonexistent);

        // Nothing left to remove the second time.
        assert_eq!(
            perform_clean_file(&ctx, action, &target).unwrap(),
            TargetState::Unchanged
        );
    }
}
