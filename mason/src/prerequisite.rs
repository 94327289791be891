// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Prerequisites: symbolic references to targets, tied to the scope in
//! which they were written.

use std::{fmt, sync::Arc, sync::OnceLock};

use crate::name::Name;
use crate::scope::ScopeId;
use crate::target::Target;

/// Result of resolving a prerequisite. A prerequisite may be resolved
/// to "ignored" by scoped search variants (out-of-directory filter).
#[derive(Debug, Clone)]
pub enum Resolution {
    Target(Arc<Target>),
    Ignored,
}

#[derive(Debug)]
pub struct Prerequisite {
    pub name: Name,
    /// The scope the prerequisite was written in; relative directories
    /// are interpreted against it.
    pub scope: ScopeId,
    /// Lazily resolved, set once. Resolution is monotone: once set, the
    /// pointer is stable.
    target: OnceLock<Resolution>,
}

impl Prerequisite {
    pub fn new(name: Name, scope: ScopeId) -> Self {
        Self {
            name,
            scope,
            target: OnceLock::new(),
        }
    }

    pub fn key(&self) -> PrerequisiteKey<'_> {
        PrerequisiteKey {
            name: &self.name,
            scope: self.scope,
        }
    }

    /// The resolved target, if resolution happened and wasn't "ignore".
    pub fn target(&self) -> Option<&Arc<Target>> {
        match self.target.get() {
            Some(Resolution::Target(t)) => Some(t),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.target.get().is_some()
    }

    /// Record the resolution. The first resolution wins; the caller's
    /// target is still returned if the prerequisite was ignored earlier.
    pub fn resolve(&self, target: Arc<Target>) -> Arc<Target> {
        match self.target.get_or_init(|| Resolution::Target(target.clone())) {
            Resolution::Target(t) => t.clone(),
            Resolution::Ignored => target,
        }
    }

    /// Mark the prerequisite as out of scope for this build.
    pub fn ignore(&self) {
        let _ = self.target.set(Resolution::Ignored);
    }
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A prerequisite identity: the name together with the referencing
/// scope.
#[derive(Debug, Clone, Copy)]
pub struct PrerequisiteKey<'a> {
    pub name: &'a Name,
    pub scope: ScopeId,
}

impl fmt::Display for PrerequisiteKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
