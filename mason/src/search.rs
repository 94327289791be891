// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Prerequisite search: resolve a symbolic prerequisite to a concrete
//! target, consulting the target cache and the filesystem.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::context::Context;
use crate::diag::{Failed, Record};
use crate::prerequisite::{Prerequisite, PrerequisiteKey};
use crate::rule;
use crate::scope::normalize;
use crate::target::{Decl, Target, TargetKey, TargetType, types};
use crate::timestamp::{self, Timestamp};
use crate::{action::Action, name::Name};

/// Resolve a prerequisite to a target:
///
/// 1. an existing target in the cache,
/// 2. for file-based types, an existing file in the src tree,
/// 3. otherwise a fresh target in the scope's out directory.
///
/// The resolution is recorded on the prerequisite (first one wins).
pub fn search(ctx: &Context, prerequisite: &Prerequisite) -> Result<Arc<Target>, Failed> {
    if let Some(target) = prerequisite.target() {
        return Ok(target.clone());
    }

    let pk = prerequisite.key();
    let tt = prerequisite_type(ctx, &pk)?;

    if let Some(custom) = tt.search {
        if let Some(target) = custom(ctx, &pk) {
            return Ok(prerequisite.resolve(target));
        }
    }

    let target = match search_existing_target(ctx, &pk, &tt) {
        Some(target) => target,
        None => match tt.file_based.then(|| search_existing_file(ctx, &pk, &tt)).flatten() {
            Some(target) => target,
            None => create_new_target(ctx, &pk, &tt),
        },
    };

    Ok(prerequisite.resolve(target))
}

/// The target type a prerequisite denotes: its explicit tag, or file /
/// dir inferred from the name's shape.
fn prerequisite_type(ctx: &Context, pk: &PrerequisiteKey<'_>) -> Result<Arc<TargetType>, Failed> {
    let type_name = match &pk.name.type_name {
        Some(name) => name.as_str(),
        None if pk.name.is_dir() => types::DIR,
        None => types::FILE,
    };

    ctx.target_type(pk.scope, type_name).ok_or_else(|| {
        Record::error(format!(
            "unknown target type {type_name} in prerequisite {}",
            pk.name
        ))
        .fail()
    })
}

/// Complete the prerequisite's directory against `base` (the scope's
/// out or src directory).
fn complete_dir(name: &Name, base: &Path) -> PathBuf {
    if name.dir.is_absolute() {
        normalize(&name.dir)
    } else if name.dir.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        normalize(&base.join(&name.dir))
    }
}

/// Consult the target cache for an already-known target.
pub fn search_existing_target(
    ctx: &Context,
    pk: &PrerequisiteKey<'_>,
    tt: &Arc<TargetType>,
) -> Option<Arc<Target>> {
    let scopes = ctx.scopes();
    let dir = complete_dir(pk.name, scopes.out_path(pk.scope));

    let key = TargetKey {
        type_name: tt.name.clone(),
        dir,
        out: PathBuf::new(),
        name: pk.name.value.clone(),
        ext: pk.name.ext.clone(),
    };

    let target = ctx.targets.find(&key)?;
    tracing::trace!(target = %target, prerequisite = %pk, "existing target");
    Some(target)
}

/// Look for an existing file in the scope's src directory; insert a
/// target with its mtime stamped if found.
pub fn search_existing_file(
    ctx: &Context,
    pk: &PrerequisiteKey<'_>,
    tt: &Arc<TargetType>,
) -> Option<Arc<Target>> {
    let scopes = ctx.scopes();

    // Resolve the extension; without one there is nothing to probe.
    let ext = match pk.name.ext.clone() {
        Some(ext) => ext,
        None => {
            let key = TargetKey {
                type_name: tt.name.clone(),
                dir: pk.name.dir.clone(),
                out: PathBuf::new(),
                name: pk.name.value.clone(),
                ext: None,
            };
            match tt.default_ext {
                Some(f) => f(&key, scopes, pk.scope, true)?,
                None => {
                    tracing::trace!(prerequisite = %pk, "no existing file (no default extension)");
                    return None;
                }
            }
        }
    };

    let src_base = scopes
        .src_path(pk.scope)
        .unwrap_or_else(|| scopes.out_path(pk.scope).to_path_buf());
    let dir = complete_dir(pk.name, &src_base);

    let mut file_name = pk.name.value.clone();
    if !ext.is_empty() {
        file_name.push('.');
        file_name.push_str(&ext);
    }
    let file = dir.join(file_name);

    let mtime = timestamp::file_mtime(&file);
    if mtime == Timestamp::Nonexistent {
        tracing::trace!(prerequisite = %pk, path = %file.display(), "no existing file");
        return None;
    }

    // The corresponding out directory, in case this src target acquires
    // outputs later. Empty for in-source builds.
    let out_base = scopes.out_path(pk.scope);
    let out = if src_base == out_base {
        PathBuf::new()
    } else {
        complete_dir(pk.name, out_base)
    };

    let (target, new) = ctx.targets.insert(
        tt,
        dir,
        out,
        pk.name.value.clone(),
        Some(ext),
        Decl::PrereqFile,
    );

    target.set_path(file);
    target.set_mtime(mtime);

    tracing::trace!(target = %target, new, prerequisite = %pk, "existing file");
    Some(target)
}

/// Insert a fresh target in the scope's out directory.
pub fn create_new_target(ctx: &Context, pk: &PrerequisiteKey<'_>, tt: &Arc<TargetType>) -> Arc<Target> {
    let dir = complete_dir(pk.name, ctx.scopes().out_path(pk.scope));

    let (target, new) = ctx.targets.insert(
        tt,
        dir,
        PathBuf::new(),
        pk.name.value.clone(),
        pk.name.ext.clone(),
        Decl::PrereqNew,
    );

    tracing::trace!(target = %target, new, prerequisite = %pk, "new target");
    target
}

/// Inject a dependency on the target's directory (or its parent) so
/// that output directories are created on update and removed on clean
/// without the buildfile having to declare them. Only directories
/// strictly inside the enclosing project's out tree qualify.
pub fn inject_fsdir(ctx: &Context, action: Action, target: &Arc<Target>, parent: bool) -> Result<(), Failed> {
    let scopes = ctx.scopes();

    let base = scopes.containing(&target.key().dir);
    // Could be outside any project.
    let Some(root) = scopes.root_of(base) else {
        return Ok(());
    };

    let dir = if parent {
        match target.key().dir.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Ok(()),
        }
    } else {
        target.key().dir.clone()
    };

    let root_out = scopes.out_path(root);
    if !dir.starts_with(root_out) || dir == root_out {
        return Ok(());
    }

    let Some(tt) = ctx.target_type(base, types::FSDIR) else {
        return Ok(());
    };

    let (fsdir, _) = ctx
        .targets
        .insert(&tt, dir, PathBuf::new(), String::new(), None, Decl::PrereqNew);

    tracing::trace!(target = %target, fsdir = %fsdir, "injecting directory dependency");

    rule::match_target(ctx, action, &fsdir)?;
    target.opstate(action).lock().prerequisite_targets.push(Some(fsdir));

    Ok(())
}

/// Search every prerequisite of `target` and match the resolved
/// targets, appending to the per-action resolved-prerequisite list
/// (injected directory dependencies stay ahead of declared ones).
pub fn search_and_match_prerequisites(ctx: &Context, action: Action, target: &Arc<Target>) -> Result<(), Failed> {
    let mut resolved = Vec::with_capacity(target.prerequisites().len());

    for prerequisite in target.prerequisites() {
        let found = search(ctx, prerequisite)?;
        rule::match_target(ctx, action, &found)?;
        resolved.push(Some(found));
    }

    target.opstate(action).lock().prerequisite_targets.extend(resolved);

    Ok(())
}

/// The scoped variant: prerequisites outside `dir` are ignored for
/// this action instead of being searched and matched.
pub fn search_and_match_prerequisites_in(
    ctx: &Context,
    action: Action,
    target: &Arc<Target>,
    dir: &Path,
) -> Result<(), Failed> {
    let dir = normalize(dir);
    let mut resolved = Vec::with_capacity(target.prerequisites().len());

    for prerequisite in target.prerequisites() {
        let found = search(ctx, prerequisite)?;

        if found.key().dir.starts_with(&dir) {
            rule::match_target(ctx, action, &found)?;
            resolved.push(Some(found));
        } else {
            prerequisite.ignore();
            resolved.push(None);
        }
    }

    target.opstate(action).lock().prerequisite_targets.extend(resolved);

    Ok(())
}
