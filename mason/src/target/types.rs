// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The built-in target types registered at the global scope.

use std::sync::Arc;

use super::{TargetKey, TargetType};
use crate::scope::{ScopeId, ScopeTree};

pub const TARGET: &str = "target";
pub const FILE: &str = "file";
pub const ALIAS: &str = "alias";
pub const DIR: &str = "dir";
pub const FSDIR: &str = "fsdir";
pub const GROUP: &str = "group";

fn file_default_ext(key: &TargetKey, _: &ScopeTree, _: ScopeId, _search: bool) -> Option<String> {
    // Plain files have no implied suffix; the name carries any real
    // extension already.
    key.ext.clone().or_else(|| Some(String::new()))
}

/// Construct the closed set of built-in types. Concrete types loaded
/// from modules derive from these (most commonly from `file`).
pub fn builtins() -> Vec<Arc<TargetType>> {
    let target = Arc::new(TargetType {
        name: TARGET.to_owned(),
        base: None,
        fixed_ext: None,
        default_ext: None,
        pattern: None,
        print: None,
        search: None,
        see_through: false,
        file_based: false,
    });

    let file = Arc::new(TargetType {
        name: FILE.to_owned(),
        base: Some(target.clone()),
        fixed_ext: None,
        default_ext: Some(file_default_ext),
        pattern: None,
        print: None,
        search: None,
        see_through: false,
        file_based: true,
    });

    let alias = Arc::new(TargetType {
        name: ALIAS.to_owned(),
        base: Some(target.clone()),
        fixed_ext: None,
        default_ext: None,
        pattern: None,
        print: None,
        search: None,
        see_through: false,
        file_based: false,
    });

    // A directory scope alias: building dir{x/} means building what the
    // x/ scope declares.
    let dir = Arc::new(TargetType {
        name: DIR.to_owned(),
        base: Some(alias.clone()),
        fixed_ext: None,
        default_ext: None,
        pattern: None,
        print: None,
        search: None,
        see_through: false,
        file_based: false,
    });

    // A directory on the filesystem, created on update and removed on
    // clean.
    let fsdir = Arc::new(TargetType {
        name: FSDIR.to_owned(),
        base: Some(target.clone()),
        fixed_ext: None,
        default_ext: None,
        pattern: None,
        print: None,
        search: None,
        see_through: false,
        file_based: false,
    });

    let group = Arc::new(TargetType {
        name: GROUP.to_owned(),
        base: Some(target.clone()),
        fixed_ext: None,
        default_ext: None,
        pattern: None,
        print: None,
        search: None,
        see_through: true,
        file_based: false,
    });

    vec![target, file, alias, dir, fsdir, group]
}
