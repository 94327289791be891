// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The scope tree: a directory-structured namespace rooted at a global
//! scope, with per-scope variable, target-type and rule maps.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use indextree::{Arena, NodeId};

use crate::action::{MetaOperationId, OperationId, meta_operations, operations};
use crate::rule::RuleMap;
use crate::target::{TargetType, TargetTypeMap};
use crate::variable::{Entry, Lookup, Var, VariableMap};

/// NodeIndex into the scope arena.
pub type ScopeId = NodeId;

/// Extra state carried by a scope that is the root of a project.
#[derive(Debug)]
pub struct RootData {
    /// Source directory paired with this scope's out directory. Equal to
    /// the out directory for in-source builds.
    pub src_dir: PathBuf,
    /// Meta-operations available in this project.
    pub meta_operations: Vec<MetaOperationId>,
    /// Operations available in this project.
    pub operations: Vec<OperationId>,
}

#[derive(Debug, Default)]
pub struct Scope {
    out_dir: PathBuf,
    pub vars: VariableMap,
    pub types: TargetTypeMap,
    pub rules: RuleMap,
    root: Option<RootData>,
}

impl Scope {
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn root_data(&self) -> Option<&RootData> {
        self.root.as_ref()
    }
}

/// The scope tree. Mutated during the load phase only; the match and
/// execute phases see a frozen tree through shared references.
#[derive(Debug)]
pub struct ScopeTree {
    arena: Arena<Scope>,
    map: HashMap<PathBuf, NodeId>,
    global: NodeId,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    pub fn new() -> Self {
        let mut arena = Arena::new();

        let global = arena.new_node(Scope {
            out_dir: PathBuf::from("/"),
            ..Default::default()
        });

        let map = HashMap::from([(PathBuf::from("/"), global)]);

        Self { arena, map, global }
    }

    pub fn global(&self) -> ScopeId {
        self.global
    }

    /// Return the scope for `dir`, creating it (and any missing
    /// intermediate scopes) as needed. Idempotent.
    pub fn insert(&mut self, dir: &Path) -> ScopeId {
        let dir = normalize(dir);

        if let Some(id) = self.map.get(&dir) {
            return *id;
        }

        let parent = match dir.parent() {
            Some(parent) => self.insert(parent),
            None => self.global,
        };

        let node = self.arena.new_node(Scope {
            out_dir: dir.clone(),
            ..Default::default()
        });
        parent.append(node, &mut self.arena);
        self.map.insert(dir, node);

        node
    }

    pub fn find(&self, dir: &Path) -> Option<ScopeId> {
        self.map.get(&normalize(dir)).copied()
    }

    /// The deepest scope containing `dir` (falling back to the global
    /// scope).
    pub fn containing(&self, dir: &Path) -> ScopeId {
        let dir = normalize(dir);

        let mut cursor: &Path = &dir;
        loop {
            if let Some(id) = self.map.get(cursor) {
                return *id;
            }
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => return self.global,
            }
        }
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        self.arena[id].get()
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        self.arena[id].get_mut()
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.arena[id].parent()
    }

    /// This scope followed by its ancestors, ending at the global scope.
    pub fn ancestors(&self, id: ScopeId) -> impl Iterator<Item = ScopeId> + '_ {
        id.ancestors(&self.arena)
    }

    /// The nearest enclosing project root, if any.
    pub fn root_of(&self, id: ScopeId) -> Option<ScopeId> {
        self.ancestors(id).find(|&s| self.get(s).is_root())
    }

    /// Mark `id` as a project root with the given source directory and
    /// the default operation tables.
    pub fn make_root(&mut self, id: ScopeId, src_dir: impl Into<PathBuf>) {
        let scope = self.get_mut(id);
        scope.root = Some(RootData {
            src_dir: src_dir.into(),
            meta_operations: meta_operations().iter().map(|mo| mo.id).collect(),
            operations: operations().iter().map(|op| op.id).collect(),
        });
    }

    pub fn out_path(&self, id: ScopeId) -> &Path {
        &self.get(id).out_dir
    }

    /// The source directory corresponding to this scope: the enclosing
    /// root's src dir plus this scope's path below the root.
    pub fn src_path(&self, id: ScopeId) -> Option<PathBuf> {
        let root = self.root_of(id)?;
        let root_scope = self.get(root);
        let data = root_scope.root_data()?;

        let rel = self
            .get(id)
            .out_dir
            .strip_prefix(&root_scope.out_dir)
            .unwrap_or(Path::new(""));

        Some(data.src_dir.join(rel))
    }

    /// Hierarchical variable lookup: this scope, then its ancestors,
    /// first definition wins. Definitions marked *extra* (inherited
    /// defaults) are still returned, flagged.
    pub fn lookup(&self, id: ScopeId, var: &str) -> Lookup {
        for scope in self.ancestors(id) {
            if let Some(entry) = self.get(scope).vars.get(var) {
                return Lookup::Defined {
                    value: entry.value.clone(),
                    extra: entry.extra,
                };
            }
        }

        Lookup::Undefined
    }

    /// Mutable definition slot for `var` in this scope.
    pub fn assign(&mut self, id: ScopeId, var: Var) -> &mut Entry {
        self.get_mut(id).vars.assign(var)
    }

    /// Like [`assign`](Self::assign), but if the variable is only
    /// defined in an outer scope its value is first copied here, so the
    /// append doesn't leak into siblings.
    pub fn append(&mut self, id: ScopeId, var: Var) -> &mut Entry {
        if self.get(id).vars.get(&var).is_none() {
            let inherited = self
                .ancestors(id)
                .skip(1)
                .find_map(|s| self.get(s).vars.get(&var).cloned());

            if let Some(entry) = inherited {
                *self.get_mut(id).vars.assign(var.clone()) = Entry {
                    value: entry.value,
                    extra: false,
                };
            }
        }

        self.get_mut(id).vars.assign(var)
    }

    /// Find a target type by name, walking this scope and its ancestors.
    pub fn find_target_type(&self, id: ScopeId, name: &str) -> Option<Arc<TargetType>> {
        self.ancestors(id).find_map(|s| self.get(s).types.find(name))
    }
}

/// Strip trailing slashes and `.` components so that map keys are
/// canonical. Scope directories must be absolute.
pub(crate) fn normalize(dir: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");

    for comp in dir.components() {
        match comp {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            comp => out.push(comp),
        }
    }

    out
}
