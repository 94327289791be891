// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Actions: a (meta-operation, operation) pair, optionally nested with
//! an outer operation.
//!
//! Operation nesting implements pre-operations: `install` needs its
//! targets up to date, so it runs `update` with `install` recorded as
//! the outer operation. Rules can recognize "update for install" and
//! behave differently, while most treat it as a plain update.

use std::fmt;

/// Meta-operation and operation ids fit in 4 bits each so that a
/// combined action id fits in one byte. 0 is not a valid id.
pub type MetaOperationId = u8;
pub type OperationId = u8;

pub const NOOP: MetaOperationId = 1;
pub const PERFORM: MetaOperationId = 2;
pub const CONFIGURE: MetaOperationId = 3;
pub const DIST: MetaOperationId = 4;

pub const DEFAULT: OperationId = 1;
pub const UPDATE: OperationId = 2;
pub const CLEAN: OperationId = 3;
pub const TEST: OperationId = 4;
pub const INSTALL: OperationId = 5;
pub const UNINSTALL: OperationId = 6;

/// Recipe execution mode.
///
/// Constructive operations naturally run a prerequisite's recipe as
/// part of its first dependent, before the dependent itself
/// (first/front). Destructive operations invert both: the prerequisite
/// is processed by its last dependent, after it (last/back) - a
/// directory can only be removed once everything inside it is gone.
/// The front/back half is realized inside dependents' recipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionMode {
    First,
    Last,
}

/// An action, stored compactly: one byte for the inner action and
/// another for the outer (0 when not nested).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    inner_id: u8,
    outer_id: u8,
}

impl Action {
    pub fn new(meta: MetaOperationId, operation: OperationId) -> Self {
        debug_assert!(meta != 0 && meta <= 0xF && operation != 0 && operation <= 0xF);

        Self {
            inner_id: (meta << 4) | operation,
            outer_id: 0,
        }
    }

    /// A nested action: `inner` performed on behalf of `outer` (e.g.
    /// update for install).
    pub fn nested(meta: MetaOperationId, inner: OperationId, outer: OperationId) -> Self {
        debug_assert!(outer != 0 && outer <= 0xF);

        Self {
            outer_id: (meta << 4) | outer,
            ..Self::new(meta, inner)
        }
    }

    pub fn meta_operation(&self) -> MetaOperationId {
        self.inner_id >> 4
    }

    pub fn operation(&self) -> OperationId {
        self.inner_id & 0xF
    }

    pub fn outer_operation(&self) -> Option<OperationId> {
        (self.outer_id != 0).then_some(self.outer_id & 0xF)
    }

    pub fn is_nested(&self) -> bool {
        self.outer_id != 0
    }

    /// The action without its outer context.
    pub fn inner_action(&self) -> Action {
        Action {
            inner_id: self.inner_id,
            outer_id: 0,
        }
    }

    /// Wire-stable identity for logging and cache keys.
    pub fn wire(&self) -> u16 {
        (u16::from(self.meta_operation()) << 12)
            | (u16::from(self.outer_id & 0xF) << 4)
            | u16::from(self.operation())
    }
}

impl fmt::Display for Action {
    /// Numeric form, mostly used in tracing: `(2,5(2))` is update for
    /// install.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},", self.meta_operation())?;

        match self.outer_operation() {
            Some(outer) => write!(f, "{outer}({}))", self.operation()),
            None => write!(f, "{})", self.operation()),
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Static description of an operation, including the name forms used
/// in diagnostics.
#[derive(Debug)]
pub struct OperationInfo {
    pub id: OperationId,
    pub name: &'static str,
    /// "update" as in "update x".
    pub name_do: &'static str,
    /// "updating" as in "configure updating x".
    pub name_doing: &'static str,
    /// "is up to date" as in "x is up to date".
    pub name_done: &'static str,
    pub mode: ExecutionMode,
}

#[derive(Debug)]
pub struct MetaOperationInfo {
    pub id: MetaOperationId,
    pub name: &'static str,
    /// Empty for `perform`, which borrows the operation's own forms.
    pub name_do: &'static str,
    pub name_doing: &'static str,
}

const OPERATIONS: &[OperationInfo] = &[
    OperationInfo {
        id: DEFAULT,
        name: "<default>",
        name_do: "",
        name_doing: "",
        name_done: "",
        mode: ExecutionMode::First,
    },
    OperationInfo {
        id: UPDATE,
        name: "update",
        name_do: "update",
        name_doing: "updating",
        name_done: "is up to date",
        mode: ExecutionMode::First,
    },
    OperationInfo {
        id: CLEAN,
        name: "clean",
        name_do: "clean",
        name_doing: "cleaning",
        name_done: "is clean",
        mode: ExecutionMode::Last,
    },
    OperationInfo {
        id: TEST,
        name: "test",
        name_do: "test",
        name_doing: "testing",
        name_done: "has nothing to test",
        mode: ExecutionMode::First,
    },
    OperationInfo {
        id: INSTALL,
        name: "install",
        name_do: "install",
        name_doing: "installing",
        name_done: "is installed",
        mode: ExecutionMode::First,
    },
    OperationInfo {
        id: UNINSTALL,
        name: "uninstall",
        name_do: "uninstall",
        name_doing: "uninstalling",
        name_done: "is not installed",
        mode: ExecutionMode::Last,
    },
];

const META_OPERATIONS: &[MetaOperationInfo] = &[
    MetaOperationInfo {
        id: NOOP,
        name: "noop",
        name_do: "",
        name_doing: "",
    },
    MetaOperationInfo {
        id: PERFORM,
        name: "perform",
        name_do: "",
        name_doing: "",
    },
    MetaOperationInfo {
        id: CONFIGURE,
        name: "configure",
        name_do: "configure",
        name_doing: "configuring",
    },
    MetaOperationInfo {
        id: DIST,
        name: "dist",
        name_do: "distribute",
        name_doing: "distributing",
    },
];

pub fn operations() -> &'static [OperationInfo] {
    OPERATIONS
}

pub fn meta_operations() -> &'static [MetaOperationInfo] {
    META_OPERATIONS
}

pub fn operation_info(id: OperationId) -> &'static OperationInfo {
    OPERATIONS
        .iter()
        .find(|op| op.id == id)
        .expect("unknown operation id")
}

pub fn meta_operation_info(id: MetaOperationId) -> &'static MetaOperationInfo {
    META_OPERATIONS
        .iter()
        .find(|mo| mo.id == id)
        .expect("unknown meta-operation id")
}
