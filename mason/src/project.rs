// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A configured project rooted in a directory: scope bootstrap, the
//! `build/` state directory and buildspec target resolution.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;

use crate::config;
use crate::context::Context;
use crate::diag::Failed;
use crate::name::Name;
use crate::prerequisite::Prerequisite;
use crate::scope::ScopeId;
use crate::search;
use crate::target::Target;

/// A project directory as seen from the driver. In-source builds for
/// now: the src and out roots coincide.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
}

impl Project {
    /// Open a project root directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root: PathBuf = root.into();

        if !root.exists() || !root.is_dir() {
            return Err(Error::RootInvalid(root));
        }

        let root = fs_err::canonicalize(&root)?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The per-project state directory under the out root.
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    /// Set up the project's root scope and load the persisted
    /// configuration, if any.
    pub fn load(&self, ctx: &mut Context) -> Result<ScopeId, Error> {
        let scope = ctx.insert_scope(&self.root);
        ctx.scopes_mut().make_root(scope, &self.root);

        config::load(ctx, scope)?;

        Ok(scope)
    }

    /// Resolve buildspec names to root targets, declaring them in the
    /// target cache.
    pub fn resolve_targets(
        &self,
        ctx: &Context,
        scope: ScopeId,
        names: &[Name],
    ) -> Result<Vec<Arc<Target>>, Failed> {
        let mut targets = Vec::with_capacity(names.len());

        for name in names {
            let prerequisite = Prerequisite::new(name.clone(), scope);
            let target = search::search(ctx, &prerequisite)?;
            targets.push(target);
        }

        Ok(targets)
    }
}

/// The default buildspec when none is given: the project directory
/// itself.
pub fn default_target_name() -> Name {
    Name::dir("dir", "./")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("project root {0:?} does not exist or is not a directory")]
    RootInvalid(PathBuf),
    #[error("io")]
    Io(#[from] io::Error),
    #[error("configuration")]
    Config(#[from] config::Error),
}
