// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The meta-operation driver: match a root set of targets for an
//! action, then execute the recipes honoring the execution mode.

use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::sync::Arc;

use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use crate::action::{self, Action, ExecutionMode, operation_info};
use crate::context::{Context, Phase};
use crate::diag::{self, Failed, Record};
use crate::execute;
use crate::rule;
use crate::target::{Target, TargetState};

/// Match and execute `targets` for `action`. Matching runs in
/// parallel; execution is parallel for constructive (first-mode)
/// operations and reverse-ordered for destructive (last-mode) ones.
/// Postponed targets are re-examined in a post pass.
pub fn perform(ctx: &Context, action: Action, targets: &[Arc<Target>], quiet: bool) -> Result<(), Failed> {
    if action.meta_operation() == action::NOOP {
        return Ok(());
    }

    ctx.set_current(action);
    ctx.bump_epoch();

    // Match.
    ctx.set_phase(Phase::Match);

    let match_failures: usize = targets
        .par_iter()
        .map(|target| {
            tracing::debug!(target = %target, "matching");
            rule::match_target(ctx, action, target).is_err() as usize
        })
        .sum();

    if match_failures > 0 {
        return Err(Failed);
    }

    // Execute, collecting postponed targets for the post pass.
    ctx.set_phase(Phase::Execute);

    let mode = operation_info(action.operation()).mode;
    let postponed = Mutex::new(Vec::new());
    let failures = AtomicUsize::new(0);

    let body = |target: &Arc<Target>| -> Result<(), Failed> {
        tracing::debug!("{}", diag::diag_doing(action, target));

        match execute::execute(ctx, action, target) {
            Ok(TargetState::Unchanged) => {
                if !quiet {
                    Record::info(diag::diag_done(action, target)).emit();
                }
                Ok(())
            }
            Ok(TargetState::Changed) => Ok(()),
            Ok(TargetState::Postponed) => {
                postponed.lock().expect("postponed list poisoned").push(target.clone());
                Ok(())
            }
            Ok(state) => unreachable!("execute returned {state}"),
            Err(Failed) => {
                failures.fetch_add(1, Ordering::SeqCst);
                if ctx.keep_going { Ok(()) } else { Err(Failed) }
            }
        }
    };

    match mode {
        ExecutionMode::First => targets.par_iter().try_for_each(body)?,
        ExecutionMode::Last => {
            for target in targets.iter().rev() {
                body(target)?;
            }
        }
    }

    // Re-examine postponed targets. This is the only reliable way to
    // find out whether they have changed.
    let postponed = postponed.into_inner().expect("postponed list poisoned");

    for target in postponed {
        match execute::execute_postponed(ctx, action, &target) {
            Ok(TargetState::Unchanged) => {
                if !quiet {
                    Record::info(diag::diag_done(action, &target)).emit();
                }
            }
            Ok(TargetState::Changed) => {}
            Ok(state) => unreachable!("postponed target {target} resolved to {state}"),
            Err(Failed) => {
                failures.fetch_add(1, Ordering::SeqCst);
                if !ctx.keep_going {
                    return Err(Failed);
                }
            }
        }
    }

    if failures.load(Ordering::SeqCst) > 0 {
        return Err(Failed);
    }

    // Every match must have been paired with an execute.
    debug_assert_eq!(
        ctx.dependency_count.load(Ordering::SeqCst),
        0,
        "matched targets left unexecuted"
    );

    Ok(())
}
