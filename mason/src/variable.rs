// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Variable names, typed values and per-scope variable maps.

use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use crate::name::Name;

/// Interned variable name. Cheap to clone and hand around; identity is
/// by content (the pool only exists to share allocations).
pub type Var = Arc<str>;

/// The process-wide variable name pool, owned by the build context.
#[derive(Debug, Default)]
pub struct VarPool {
    names: Mutex<std::collections::HashSet<Arc<str>>>,
}

impl VarPool {
    pub fn intern(&self, name: &str) -> Var {
        let mut names = self.names.lock().expect("var pool poisoned");

        if let Some(existing) = names.get(name) {
            return existing.clone();
        }

        let var: Arc<str> = Arc::from(name);
        names.insert(var.clone());
        var
    }
}

/// A target triplet (`x86_64-linux-gnu`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triplet {
    pub cpu: String,
    pub vendor: String,
    pub system: String,
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.cpu, self.vendor, self.system)
    }
}

/// A typed variable value. The set of types is closed; anything more
/// exotic is carried as a name list and interpreted by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    UInt(u64),
    String(String),
    Path(PathBuf),
    DirPath(PathBuf),
    AbsDirPath(PathBuf),
    Name(Name),
    NamePair(Name, Name),
    Names(Vec<Name>),
    Strings(Vec<String>),
    Paths(Vec<PathBuf>),
    DirPaths(Vec<PathBuf>),
    Triplet(Triplet),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&PathBuf> {
        match self {
            Value::Path(p) | Value::DirPath(p) | Value::AbsDirPath(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    /// Buildfile-syntax rendition, as persisted in `config.build`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::UInt(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Path(p) | Value::DirPath(p) | Value::AbsDirPath(p) => {
                write!(f, "{}", p.display())
            }
            Value::Name(n) => write!(f, "{n}"),
            Value::NamePair(a, b) => write!(f, "{a}@{b}"),
            Value::Names(names) => list(f, names),
            Value::Strings(strings) => list(f, strings),
            Value::Paths(paths) | Value::DirPaths(paths) => {
                for (i, p) in paths.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", p.display())?;
                }
                Ok(())
            }
            Value::Triplet(t) => write!(f, "{t}"),
        }
    }
}

/// One definition in a variable map. `value` of `None` is the null
/// value ("configured as unspecified"), distinct from no entry at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub value: Option<Value>,
    /// Marks an inherited default rather than an explicit assignment.
    /// Lookups still return the entry but surface this flag.
    pub extra: bool,
}

/// Result of a hierarchical variable lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Undefined,
    Defined {
        value: Option<Value>,
        extra: bool,
    },
}

impl Lookup {
    pub fn defined(&self) -> bool {
        matches!(self, Lookup::Defined { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Lookup::Defined { value, .. } => value.as_ref(),
            Lookup::Undefined => None,
        }
    }

    pub fn extra(&self) -> bool {
        matches!(self, Lookup::Defined { extra: true, .. })
    }
}

/// The per-scope variable map. Ordered so that enumeration (config
/// saving, namespace queries) is deterministic.
#[derive(Debug, Default)]
pub struct VariableMap {
    map: BTreeMap<Var, Entry>,
}

impl VariableMap {
    pub fn get(&self, var: &str) -> Option<&Entry> {
        self.map.get(var)
    }

    /// Insert-or-fetch the mutable definition slot for `var`.
    pub fn assign(&mut self, var: Var) -> &mut Entry {
        self.map.entry(var).or_default()
    }

    pub fn remove(&mut self, var: &str) -> Option<Entry> {
        self.map.remove(var)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Entry)> {
        self.map.iter()
    }

    /// All definitions whose name starts with `prefix.` (or equals it).
    pub fn find_namespace<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a Var, &'a Entry)> {
        self.map.iter().filter(move |(name, _)| {
            name.as_ref() == prefix || name.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.'))
        })
    }
}
