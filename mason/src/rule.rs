// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Rules, the rule registry and the matching protocol that resolves a
//! (target, action) pair to a recipe.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::Arc,
    thread,
};

use crate::action::{Action, MetaOperationId, OperationId};
use crate::context::Context;
use crate::diag::{self, Failed, Record};
use crate::target::{Target, TargetState, TargetType};

pub mod builtin;

/// Opaque data a rule's `matches` hands to its `apply`.
pub type MatchData = Box<dyn Any + Send>;

/// The callable performing one (action, target). The engine translates
/// an `Err` into the target's `failed` state.
pub type Recipe = Arc<dyn Fn(&Context, Action, &Arc<Target>) -> Result<TargetState, Failed> + Send + Sync>;

/// A rule: something that can build a target for an action.
///
/// Rule instances are singletons registered at module load; all state
/// for one match lives in the returned [`MatchData`].
pub trait Rule: Send + Sync {
    /// Decide whether this rule can build this target for this action.
    /// `hint` is the caller-supplied disambiguation string. Returning
    /// `Some` commits the rule for the subsequent [`apply`](Self::apply).
    fn matches(
        &self,
        ctx: &Context,
        action: Action,
        target: &Arc<Target>,
        hint: &str,
    ) -> Result<Option<MatchData>, Failed>;

    /// Prepare the target (derive paths, resolve members, schedule
    /// prerequisites) and produce the recipe.
    fn apply(
        &self,
        ctx: &Context,
        action: Action,
        target: &Arc<Target>,
        data: MatchData,
    ) -> Result<Recipe, Failed>;
}

/// A recipe that does nothing and reports the target unchanged.
pub fn noop_recipe() -> Recipe {
    Arc::new(|_, _, _| Ok(TargetState::Unchanged))
}

/// A recipe that executes the target's prerequisites (in the current
/// execution mode's order) and propagates their combined state.
pub fn default_recipe() -> Recipe {
    Arc::new(|ctx, action, target| {
        match ctx.current().mode {
            crate::action::ExecutionMode::First => crate::execute::execute_prerequisites(ctx, action, target),
            crate::action::ExecutionMode::Last => {
                crate::execute::reverse_execute_prerequisites(ctx, action, target)
            }
        }
    })
}

/// Per-scope rule registry: (meta-operation, operation) and target type
/// name to an ordered list of (rule name, rule). The rule name doubles
/// as the hint key.
#[derive(Default)]
pub struct RuleMap {
    map: HashMap<(MetaOperationId, OperationId), HashMap<String, Vec<(String, Arc<dyn Rule>)>>>,
}

impl RuleMap {
    pub fn insert(
        &mut self,
        meta_operation: MetaOperationId,
        operation: OperationId,
        type_name: impl Into<String>,
        rule_name: impl Into<String>,
        rule: Arc<dyn Rule>,
    ) {
        self.map
            .entry((meta_operation, operation))
            .or_default()
            .entry(type_name.into())
            .or_default()
            .push((rule_name.into(), rule));
    }

    pub fn find(
        &self,
        meta_operation: MetaOperationId,
        operation: OperationId,
        type_name: &str,
    ) -> Option<&[(String, Arc<dyn Rule>)]> {
        self.map
            .get(&(meta_operation, operation))
            .and_then(|types| types.get(type_name))
            .map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for RuleMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries = f.debug_map();
        for (key, types) in &self.map {
            entries.entry(
                key,
                &types
                    .iter()
                    .map(|(tt, rules)| (tt, rules.iter().map(|(n, _)| n).collect::<Vec<_>>()))
                    .collect::<HashMap<_, _>>(),
            );
        }
        entries.finish()
    }
}

/// Resolve `target` to a recipe for `action`. Idempotent per (action,
/// target): a second call returns once the recipe is already installed.
pub fn match_target(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<(), Failed> {
    match_target_hinted(ctx, action, target, "")
}

pub fn match_target_hinted(
    ctx: &Context,
    action: Action,
    target: &Arc<Target>,
    hint: &str,
) -> Result<(), Failed> {
    let slot = target.opstate(action);
    let epoch = ctx.epoch();

    {
        let mut data = slot.lock();

        loop {
            if data.epoch == epoch && data.wire == action.wire() && data.recipe.is_some() {
                return Ok(());
            }

            match data.busy {
                Some(tid) if tid == thread::current().id() => {
                    drop(data);
                    return Err(Record::error(format!(
                        "dependency cycle detected while matching target {target}"
                    ))
                    .fail());
                }
                Some(_) => {
                    data = slot.cond.wait(data).expect("target state poisoned");
                }
                None => break,
            }
        }

        // A slot left over from a previous run or action is recycled
        // wholesale.
        if data.epoch != epoch || data.wire != action.wire() {
            data.epoch = epoch;
            data.wire = action.wire();
            data.state = TargetState::Unknown;
            data.recipe = None;
            data.postponed_once = false;
        }

        // The apply about to run rebuilds the resolved-prerequisite
        // list from scratch (rules append to it).
        data.prerequisite_targets.clear();

        data.busy = Some(thread::current().id());
    }

    let result = run_match(ctx, action, target, hint);

    let mut data = slot.lock();
    data.busy = None;

    let out = match result {
        Ok(recipe) => {
            data.recipe = Some(recipe);
            data.state = TargetState::Unknown;
            ctx.dependency_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            Ok(())
        }
        Err(e) => Err(e),
    };

    drop(data);
    slot.cond.notify_all();

    out
}

/// The matching policy: walk the target's type chain starting from its
/// concrete type; at each type gather the rules registered at the
/// enclosing root scope and the global scope, filter by hint, and try
/// them. Exactly one rule may claim the match.
fn run_match(ctx: &Context, action: Action, target: &Arc<Target>, hint: &str) -> Result<Recipe, Failed> {
    let scopes = ctx.scopes();

    let base = scopes.containing(&target.key().dir);
    let root = scopes.root_of(base).filter(|r| *r != scopes.global());

    let meta = action.meta_operation();
    let operation = action.operation();

    let mut current: Option<Arc<TargetType>> = Some(target.target_type().clone());

    while let Some(tt) = current {
        let mut candidates: Vec<(String, Arc<dyn Rule>)> = Vec::new();

        for scope in root.into_iter().chain(Some(scopes.global())) {
            if let Some(rules) = scopes.get(scope).rules.find(meta, operation, &tt.name) {
                candidates.extend(rules.iter().cloned());
            }
        }

        candidates.retain(|(name, _)| name.starts_with(hint));

        if let Some(recipe) = try_candidates(ctx, action, target, hint, &candidates)? {
            return Ok(recipe);
        }

        // No rules registered (or none matched) for this target type,
        // try the base.
        current = tt.base.clone();
    }

    Err(Record::error(format!("no rule to {}", diag::diag_do(action, target))).fail())
}

fn try_candidates(
    ctx: &Context,
    action: Action,
    target: &Arc<Target>,
    hint: &str,
    candidates: &[(String, Arc<dyn Rule>)],
) -> Result<Option<Recipe>, Failed> {
    let mut matched: Option<(&str, &Arc<dyn Rule>, MatchData)> = None;
    let mut also_matched: Vec<&str> = Vec::new();

    for (name, rule) in candidates {
        let data = rule.matches(ctx, action, target, hint).map_err(|e| {
            Record::info(format!("while matching rule {name} for target {target}")).emit();
            e
        })?;

        if let Some(data) = data {
            if matched.is_none() {
                matched = Some((name.as_str(), rule, data));
            } else {
                also_matched.push(name.as_str());
            }
        }
    }

    let Some((name, rule, data)) = matched else {
        return Ok(None);
    };

    // The ambiguity test.
    if !also_matched.is_empty() {
        let mut record = Record::error(format!("multiple rules matching target {target}"))
            .with_info(format!("rule {name} matches"));
        for also in also_matched {
            record = record.with_info(format!("rule {also} also matches"));
        }
        return Err(record.with_info("use rule hint to disambiguate this match").fail());
    }

    tracing::debug!(rule = name, target = %target, action = %action, "matched");

    rule.apply(ctx, action, target, data)
        .map_err(|e| {
            Record::info(format!("while applying rule {name} for target {target}")).emit();
            e
        })
        .map(Some)
}
