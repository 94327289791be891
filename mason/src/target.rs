// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Targets, target types and the interning target cache.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, OnceLock, RwLock, Weak},
    thread::ThreadId,
};

use crate::action::Action;
use crate::prerequisite::Prerequisite;
use crate::rule::Recipe;
use crate::scope::{ScopeId, ScopeTree};
use crate::timestamp::{self, Timestamp};

pub mod types;

/// Dynamic target-type descriptor. A single instance exists per type
/// per build context; behavior of "opaque" target kinds is entirely
/// driven by the optional functions below.
#[derive(Debug)]
pub struct TargetType {
    /// Unique within a context.
    pub name: String,
    /// Base type for the is-a chain.
    pub base: Option<Arc<TargetType>>,
    /// Fixed extension, if this type always uses one.
    pub fixed_ext: Option<fn(&TargetKey) -> &'static str>,
    /// Derive the default extension; `search` is true when called on
    /// behalf of prerequisite resolution.
    pub default_ext: Option<fn(&TargetKey, &ScopeTree, ScopeId, bool) -> Option<String>>,
    /// Amend a name pattern (reverse = undo the amendment on matches).
    pub pattern: Option<fn(&TargetType, &ScopeTree, ScopeId, &mut String, &mut Option<String>, bool) -> bool>,
    /// Custom display of a target key.
    pub print: Option<fn(&mut fmt::Formatter<'_>, &TargetKey) -> fmt::Result>,
    /// Custom prerequisite resolution, consulted before the standard
    /// cache and filesystem searches.
    pub search: Option<fn(&crate::context::Context, &crate::prerequisite::PrerequisiteKey<'_>) -> Option<Arc<Target>>>,
    /// A group with the default "see through" semantics.
    pub see_through: bool,
    /// Targets of this type correspond to filesystem entries and carry
    /// a path and mtime.
    pub file_based: bool,
}

impl TargetType {
    /// Walk the base chain. Type identity is by name, which is unique
    /// within a context.
    pub fn is_a(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }

        let mut base = self.base.as_ref();
        while let Some(tt) = base {
            if tt.name == name {
                return true;
            }
            base = tt.base.as_ref();
        }

        false
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Target type name to descriptor mapping, carried per scope.
#[derive(Debug, Default)]
pub struct TargetTypeMap {
    map: HashMap<String, Arc<TargetType>>,
}

impl TargetTypeMap {
    pub fn find(&self, name: &str) -> Option<Arc<TargetType>> {
        self.map.get(name).cloned()
    }

    pub fn insert(&mut self, tt: Arc<TargetType>) -> Arc<TargetType> {
        self.map.insert(tt.name.clone(), tt.clone());
        tt
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The identity tuple a target is interned by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub type_name: String,
    /// The target's directory.
    pub dir: PathBuf,
    /// The out directory when `dir` is in the src tree; empty when the
    /// target itself lives in the out tree.
    pub out: PathBuf,
    pub name: String,
    pub ext: Option<String>,
}

/// How a target entered the cache; explicit declarations win over
/// prerequisite-induced ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Decl {
    /// Created to stand for an unresolved prerequisite.
    PrereqNew,
    /// Created for a prerequisite backed by an existing file.
    PrereqFile,
    /// Declared by the front-end.
    Real,
}

/// Per-action result state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TargetState {
    #[default]
    Unknown,
    Postponed,
    Unchanged,
    Changed,
    Failed,
}

impl TargetState {
    /// Combine result states: any change is a change.
    pub fn merge(self, other: TargetState) -> TargetState {
        match (self, other) {
            (TargetState::Failed, _) | (_, TargetState::Failed) => TargetState::Failed,
            (TargetState::Changed, _) | (_, TargetState::Changed) => TargetState::Changed,
            _ => TargetState::Unchanged,
        }
    }
}

/// One of the two per-action state slots of a target (inner and outer
/// operation).
#[derive(Default)]
pub struct OpState {
    data: Mutex<OpStateData>,
    pub(crate) cond: Condvar,
}

#[derive(Default)]
pub struct OpStateData {
    /// The match epoch this slot was last matched in; a slot stamped
    /// with an older epoch is stale and gets recycled.
    pub epoch: u64,
    /// Wire id of the action this slot currently serves.
    pub wire: u16,
    pub state: TargetState,
    pub recipe: Option<Recipe>,
    /// Prerequisites as resolved for this action, in declaration order.
    /// `None` marks a prerequisite ignored for this action.
    pub prerequisite_targets: Vec<Option<Arc<Target>>>,
    /// Thread currently matching or executing this slot; used both to
    /// serialize concurrent requests and to catch dependency cycles.
    pub(crate) busy: Option<ThreadId>,
    /// A target may be postponed only once.
    pub(crate) postponed_once: bool,
}

impl OpState {
    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, OpStateData> {
        self.data.lock().expect("target state poisoned")
    }
}

/// A node of the build graph, uniquely keyed and owned by the cache.
pub struct Target {
    key: TargetKey,
    target_type: Arc<TargetType>,
    decl: Mutex<Decl>,
    /// Back-pointer to the containing group, if any. Weak: the cache is
    /// the only owner of targets.
    group: OnceLock<Weak<Target>>,
    /// Forward pointers to group members.
    members: OnceLock<Vec<Arc<Target>>>,
    prerequisites: OnceLock<Vec<Prerequisite>>,
    path: OnceLock<PathBuf>,
    mtime: Mutex<Timestamp>,
    /// State slot for the inner (pre-)operation of a nested action.
    pub(crate) inner: OpState,
    /// State slot for a directly requested operation.
    pub(crate) outer: OpState,
}

impl Target {
    fn new(key: TargetKey, target_type: Arc<TargetType>, decl: Decl) -> Self {
        Self {
            key,
            target_type,
            decl: Mutex::new(decl),
            group: OnceLock::new(),
            members: OnceLock::new(),
            prerequisites: OnceLock::new(),
            path: OnceLock::new(),
            mtime: Mutex::new(Timestamp::Unknown),
            inner: OpState::default(),
            outer: OpState::default(),
        }
    }

    pub fn key(&self) -> &TargetKey {
        &self.key
    }

    pub fn target_type(&self) -> &Arc<TargetType> {
        &self.target_type
    }

    pub fn is_a(&self, type_name: &str) -> bool {
        self.target_type.is_a(type_name)
    }

    pub fn decl(&self) -> Decl {
        *self.decl.lock().expect("decl poisoned")
    }

    fn promote_decl(&self, decl: Decl) {
        let mut current = self.decl.lock().expect("decl poisoned");
        if decl > *current {
            *current = decl;
        }
    }

    /// Install the prerequisite list. Returns false if already set:
    /// once observed by the match phase, prerequisites never change.
    pub fn set_prerequisites(&self, prerequisites: Vec<Prerequisite>) -> bool {
        self.prerequisites.set(prerequisites).is_ok()
    }

    pub fn prerequisites(&self) -> &[Prerequisite] {
        self.prerequisites.get().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn group(&self) -> Option<Arc<Target>> {
        self.group.get().and_then(Weak::upgrade)
    }

    pub fn set_group(&self, group: &Arc<Target>) {
        let _ = self.group.set(Arc::downgrade(group));
    }

    pub fn members(&self) -> &[Arc<Target>] {
        self.members.get().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn set_members(self: &Arc<Self>, members: Vec<Arc<Target>>) {
        for member in &members {
            member.set_group(self);
        }
        let _ = self.members.set(members);
    }

    /// The filesystem path of a file-like target, deriving it from the
    /// identity key on first use.
    pub fn path(&self) -> &Path {
        self.path.get_or_init(|| {
            let mut file = self.key.name.clone();
            if let Some(ext) = self.key.ext.as_deref().filter(|e| !e.is_empty()) {
                file.push('.');
                file.push_str(ext);
            }
            self.key.dir.join(file)
        })
    }

    /// Set the path explicitly (e.g. when resolved against the src
    /// tree). No-op if already set.
    pub fn set_path(&self, path: PathBuf) {
        let _ = self.path.set(path);
    }

    pub fn mtime(&self) -> Timestamp {
        *self.mtime.lock().expect("mtime poisoned")
    }

    pub fn set_mtime(&self, mtime: Timestamp) {
        *self.mtime.lock().expect("mtime poisoned") = mtime;
    }

    /// The mtime, probing the filesystem on first use.
    pub fn load_mtime(&self) -> Timestamp {
        let mut mtime = self.mtime.lock().expect("mtime poisoned");

        if mtime.is_unknown() {
            *mtime = timestamp::file_mtime(self.path());
        }

        *mtime
    }

    /// Select the state slot for an action: nested (pre-)operations use
    /// the inner slot, directly requested operations the outer one, so
    /// e.g. update-for-install and install never collide.
    pub(crate) fn opstate(&self, action: Action) -> &OpState {
        if action.is_nested() { &self.inner } else { &self.outer }
    }

    pub fn state(&self, action: Action) -> TargetState {
        self.opstate(action).lock().state
    }

    /// True once a recipe has been installed for this action (in any
    /// driver run).
    pub fn matched(&self, action: Action) -> bool {
        let data = self.opstate(action).lock();
        data.wire == action.wire() && data.recipe.is_some()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(print) = self.target_type.print {
            return print(f, &self.key);
        }

        write!(f, "{}{{", self.key.type_name)?;
        if !self.key.dir.as_os_str().is_empty() {
            let dir = self.key.dir.display().to_string();
            write!(f, "{dir}")?;
            if !dir.ends_with('/') {
                write!(f, "/")?;
            }
        }
        write!(f, "{}", self.key.name)?;
        if let Some(ext) = self.key.ext.as_deref().filter(|e| !e.is_empty()) {
            write!(f, ".{ext}")?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target").field("key", &self.key).finish_non_exhaustive()
    }
}

/// The interning target cache: at most one target object per identity
/// tuple, atomically. The cache exclusively owns every target; all
/// other holders keep `Arc` references handed out from here.
#[derive(Debug, Default)]
pub struct TargetCache {
    map: RwLock<HashMap<TargetKey, Arc<Target>>>,
}

impl TargetCache {
    pub fn find(&self, key: &TargetKey) -> Option<Arc<Target>> {
        self.map.read().expect("target cache poisoned").get(key).cloned()
    }

    /// Type-narrowed find: the cached target must be of (or derive
    /// from) the given type.
    pub fn find_is_a(&self, key: &TargetKey, type_name: &str) -> Option<Arc<Target>> {
        self.find(key).filter(|t| t.is_a(type_name))
    }

    /// Atomic get-or-create by identity tuple.
    pub fn insert(
        &self,
        target_type: &Arc<TargetType>,
        dir: PathBuf,
        out: PathBuf,
        name: String,
        ext: Option<String>,
        decl: Decl,
    ) -> (Arc<Target>, bool) {
        let key = TargetKey {
            type_name: target_type.name.clone(),
            dir,
            out,
            name,
            ext,
        };

        let mut map = self.map.write().expect("target cache poisoned");

        if let Some(existing) = map.get(&key) {
            existing.promote_decl(decl);
            return (existing.clone(), false);
        }

        let target = Arc::new(Target::new(key.clone(), target_type.clone(), decl));
        map.insert(key, target.clone());

        (target, true)
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("target cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every cached target, in unspecified order.
    pub fn all(&self) -> Vec<Arc<Target>> {
        self.map.read().expect("target cache poisoned").values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::action;

    fn file_type() -> Arc<TargetType> {
        types::builtins()
            .into_iter()
            .find(|t| t.name == "file")
            .unwrap()
    }

    #[test]
    fn interning_returns_same_target() {
        let cache = TargetCache::default();
        let file = file_type();

        let (a, new_a) = cache.insert(
            &file,
            "/proj".into(),
            PathBuf::new(),
            "hello".into(),
            Some("o".into()),
            Decl::Real,
        );
        let (b, new_b) = cache.insert(
            &file,
            "/proj".into(),
            PathBuf::new(),
            "hello".into(),
            Some("o".into()),
            Decl::PrereqNew,
        );

        assert!(new_a);
        assert!(!new_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_insert_creates_one_target() {
        let cache = Arc::new(TargetCache::default());
        let file = file_type();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let file = file.clone();
                std::thread::spawn(move || {
                    cache.insert(
                        &file,
                        "/proj".into(),
                        PathBuf::new(),
                        "shared".into(),
                        None,
                        Decl::PrereqNew,
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, new)| *new).count(), 1);
        assert_eq!(cache.len(), 1);

        let first = &results[0].0;
        assert!(results.iter().all(|(t, _)| Arc::ptr_eq(t, first)));
    }

    #[test]
    fn decl_promotes_but_never_demotes() {
        let cache = TargetCache::default();
        let file = file_type();

        let (t, _) = cache.insert(
            &file,
            "/p".into(),
            PathBuf::new(),
            "a".into(),
            None,
            Decl::PrereqNew,
        );
        assert_eq!(t.decl(), Decl::PrereqNew);

        cache.insert(&file, "/p".into(), PathBuf::new(), "a".into(), None, Decl::Real);
        assert_eq!(t.decl(), Decl::Real);

        cache.insert(&file, "/p".into(), PathBuf::new(), "a".into(), None, Decl::PrereqFile);
        assert_eq!(t.decl(), Decl::Real);
    }

    #[test]
    fn is_a_walks_base_chain() {
        let file = file_type();
        assert!(file.is_a("file"));
        assert!(file.is_a("target"));
        assert!(!file.is_a("alias"));
    }

    #[test]
    fn nested_and_plain_actions_use_distinct_slots() {
        let cache = TargetCache::default();
        let file = file_type();
        let (t, _) = cache.insert(&file, "/p".into(), PathBuf::new(), "a".into(), None, Decl::Real);

        let install = Action::new(action::PERFORM, action::INSTALL);
        let update_for_install = Action::nested(action::PERFORM, action::UPDATE, action::INSTALL);

        t.opstate(update_for_install).lock().state = TargetState::Changed;

        assert_eq!(t.state(install), TargetState::Unknown);
        assert_eq!(t.state(update_for_install), TargetState::Changed);
    }

    #[test]
    fn typed_find_walks_base_chain() {
        let cache = TargetCache::default();
        let file = file_type();

        let (t, _) = cache.insert(&file, "/p".into(), PathBuf::new(), "a".into(), None, Decl::Real);

        assert!(cache.find_is_a(t.key(), "file").is_some());
        assert!(cache.find_is_a(t.key(), "target").is_some());
        assert!(cache.find_is_a(t.key(), "alias").is_none());
    }

    #[test]
    fn group_members_link_back() {
        let cache = TargetCache::default();
        let group = types::builtins().into_iter().find(|t| t.name == "group").unwrap();
        let file = file_type();

        let (g, _) = cache.insert(&group, "/p".into(), PathBuf::new(), "lib".into(), None, Decl::Real);
        let (m, _) = cache.insert(&file, "/p".into(), PathBuf::new(), "lib".into(), Some("a".into()), Decl::Real);

        g.set_members(vec![m.clone()]);

        assert!(group.see_through);
        assert_eq!(g.members().len(), 1);
        assert!(Arc::ptr_eq(&m.group().unwrap(), &g));
    }

    #[test]
    fn prerequisites_set_once() {
        let cache = TargetCache::default();
        let file = file_type();
        let (t, _) = cache.insert(&file, "/p".into(), PathBuf::new(), "a".into(), None, Decl::Real);

        assert!(t.set_prerequisites(vec![]));
        assert!(!t.set_prerequisites(vec![]));
    }

    #[test]
    fn path_derived_from_key() {
        let cache = TargetCache::default();
        let file = file_type();
        let (t, _) = cache.insert(
            &file,
            "/proj".into(),
            PathBuf::new(),
            "hello".into(),
            Some("cxx".into()),
            Decl::Real,
        );

        assert_eq!(t.path(), Path::new("/proj/hello.cxx"));
    }

    #[test]
    fn state_merge() {
        use TargetState::{Changed, Failed, Unchanged};

        assert_eq!(Unchanged.merge(Changed), Changed);
        assert_eq!(Changed.merge(Unchanged), Changed);
        assert_eq!(Unchanged.merge(Unchanged), Unchanged);
        assert_eq!(Changed.merge(Failed), Failed);
    }
}
