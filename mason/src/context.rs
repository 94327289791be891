// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build context: every process-wide pool (scopes, target cache,
//! variable names) grouped into one value, plus the phase machine.
//!
//! The phase discipline maps onto Rust's borrow rules: everything that
//! mutates the scope tree requires `&mut Context` and asserts the load
//! phase; the match and execute phases share the context and only go
//! through interior-mutable structures (target cache inserts, per-target
//! state slots).

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        Mutex, RwLock,
        atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
    sync::Arc,
};

use crate::action::{
    self, Action, ExecutionMode, MetaOperationId, OperationId, operation_info,
};
use crate::rule::{Rule, builtin};
use crate::scope::{ScopeId, ScopeTree};
use crate::target::{TargetCache, TargetType, types};
use crate::variable::{Value, Var, VarPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// Single-threaded; scopes, targets and prerequisite lists are
    /// mutated here and only here.
    Load,
    /// Parallel; recipes and per-action state are installed.
    Match,
    /// Parallel; recipes run.
    Execute,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Load,
            1 => Phase::Match,
            _ => Phase::Execute,
        }
    }
}

/// The meta-operation/operation pair currently being performed, with
/// its execution mode. Set by the driver between phases.
#[derive(Debug, Clone, Copy)]
pub struct Current {
    pub meta_operation: MetaOperationId,
    pub operation: OperationId,
    pub mode: ExecutionMode,
}

impl Default for Current {
    fn default() -> Self {
        Self {
            meta_operation: action::PERFORM,
            operation: action::DEFAULT,
            mode: ExecutionMode::First,
        }
    }
}

pub struct Context {
    scopes: ScopeTree,
    pub targets: TargetCache,
    pub var_pool: VarPool,

    /// Command-line variable overrides, layered over every scope.
    overrides: HashMap<String, Value>,

    phase: AtomicU8,
    current: RwLock<Current>,

    /// The match epoch: bumped per driver run so that state slots from
    /// a previous run are recognized as stale and re-matched.
    match_epoch: AtomicU64,

    /// Incremented per successful match, decremented per executed
    /// target; must return to zero by the end of the execute phase.
    pub dependency_count: AtomicUsize,

    /// Variables marked "to be saved" by the configuration predicates
    /// while the configure meta-operation is current.
    save: Mutex<BTreeMap<Var, u64>>,

    pub verbosity: u8,
    pub dry_run: bool,
    pub keep_going: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a context with the built-in target types and rules
    /// registered at the global scope.
    pub fn new() -> Self {
        let mut scopes = ScopeTree::new();
        let global = scopes.global();

        let scope = scopes.get_mut(global);
        for tt in types::builtins() {
            scope.types.insert(tt);
        }

        builtin::register(&mut scope.rules);

        Self {
            scopes,
            targets: TargetCache::default(),
            var_pool: VarPool::default(),
            overrides: HashMap::new(),
            phase: AtomicU8::new(0),
            current: RwLock::new(Current::default()),
            match_epoch: AtomicU64::new(1),
            dependency_count: AtomicUsize::new(0),
            save: Mutex::new(BTreeMap::new()),
            verbosity: 0,
            dry_run: false,
            keep_going: false,
        }
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    // Phase machine.

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    #[track_caller]
    pub fn assert_phase(&self, expected: Phase) {
        let actual = self.phase();
        assert!(
            actual == expected,
            "operation requires the {expected} phase (currently in {actual})"
        );
    }

    // Scopes.

    pub fn scopes(&self) -> &ScopeTree {
        &self.scopes
    }

    /// Mutable access to the scope tree; load phase only.
    pub fn scopes_mut(&mut self) -> &mut ScopeTree {
        self.assert_phase(Phase::Load);
        &mut self.scopes
    }

    pub fn global_scope(&self) -> ScopeId {
        self.scopes.global()
    }

    pub fn insert_scope(&mut self, dir: &Path) -> ScopeId {
        self.scopes_mut().insert(dir)
    }

    /// Find a target type visible from `scope`.
    pub fn target_type(&self, scope: ScopeId, name: &str) -> Option<Arc<TargetType>> {
        self.scopes.find_target_type(scope, name)
    }

    /// Register a rule for (meta-operation, operation) on a target type
    /// at the given (root) scope.
    pub fn insert_rule(
        &mut self,
        scope: ScopeId,
        meta_operation: MetaOperationId,
        operation: OperationId,
        type_name: impl Into<String>,
        rule_name: impl Into<String>,
        rule: Arc<dyn Rule>,
    ) {
        self.assert_phase(Phase::Load);
        self.scopes
            .get_mut(scope)
            .rules
            .insert(meta_operation, operation, type_name, rule_name, rule);
    }

    // Overrides.

    /// Enter a command-line variable override. Load phase only.
    pub fn add_override(&mut self, var: impl Into<String>, value: Value) {
        self.assert_phase(Phase::Load);
        self.overrides.insert(var.into(), value);
    }

    /// Apply command-line overrides to a lookup result. Returns the
    /// effective lookup and whether the override changed the original
    /// value ("new").
    pub fn find_override(&self, var: &str, original: &crate::variable::Lookup) -> (crate::variable::Lookup, bool) {
        use crate::variable::Lookup;

        match self.overrides.get(var) {
            Some(value) => {
                let new = original.value() != Some(value);
                (
                    Lookup::Defined {
                        value: Some(value.clone()),
                        extra: false,
                    },
                    new,
                )
            }
            None => (original.clone(), false),
        }
    }

    pub fn has_override(&self, var: &str) -> bool {
        self.overrides.contains_key(var)
    }

    /// The current match epoch.
    pub fn epoch(&self) -> u64 {
        self.match_epoch.load(Ordering::Acquire)
    }

    /// Start a new driver run: state slots stamped with older epochs
    /// become stale. Returns the new epoch.
    pub fn bump_epoch(&self) -> u64 {
        self.match_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    // Current action.

    pub fn current(&self) -> Current {
        *self.current.read().expect("current poisoned")
    }

    /// Record the action about to be performed; picks up the execution
    /// mode from the operation table.
    pub fn set_current(&self, action: Action) {
        *self.current.write().expect("current poisoned") = Current {
            meta_operation: action.meta_operation(),
            operation: action.operation(),
            mode: operation_info(action.operation()).mode,
        };
    }

    // Configuration save set.

    pub fn save_variable(&self, var: Var, flags: u64) {
        self.save.lock().expect("save set poisoned").insert(var, flags);
    }

    pub fn saved_variables(&self) -> Vec<(Var, u64)> {
        self.save
            .lock()
            .expect("save set poisoned")
            .iter()
            .map(|(v, f)| (v.clone(), *f))
            .collect()
    }
}
