// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! User-facing diagnostics: multi-line records, the build-failure
//! sentinel and the action phrase builders.

use std::fmt::Display;
use std::thread;

use itertools::Itertools;
use thiserror::Error;

use crate::action::{Action, meta_operation_info, operation_info};
use crate::target::Target;

/// The build-failure sentinel. Diagnostics are always emitted at the
/// failure point; this type only propagates the fact.
#[derive(Debug, Clone, Copy, Error)]
#[error("build failed")]
pub struct Failed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Level {
    Error,
    Warn,
    Info,
    Text,
}

/// A diagnostics record: a primary message plus `info:` continuation
/// lines, flushed as one unit when emitted or dropped. Records created
/// while unwinding a panic stay silent.
#[derive(Debug)]
pub struct Record {
    level: Level,
    lines: Vec<String>,
    emitted: bool,
}

impl Record {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            lines: vec![message.into()],
            emitted: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(Level::Warn, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Level::Info, message)
    }

    /// Append an `info:` continuation line.
    pub fn with_info(mut self, message: impl Into<String>) -> Self {
        self.lines.push(message.into());
        self
    }

    fn message(&self) -> String {
        self.lines.iter().join("\n  info: ")
    }

    fn flush(&mut self) {
        if self.emitted {
            return;
        }
        self.emitted = true;

        let message = self.message();

        match self.level {
            Level::Error => tracing::error!("{message}"),
            Level::Warn => tracing::warn!("{message}"),
            Level::Info => tracing::info!("{message}"),
            Level::Text => println!("{message}"),
        }
    }

    pub fn emit(mut self) {
        self.flush();
    }

    /// Emit and return the failure sentinel; the usual way to abort a
    /// recipe or a match.
    pub fn fail(mut self) -> Failed {
        self.flush();
        Failed
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        // An in-flight unwind means whatever failed has already been
        // reported; a half-built record would only add noise.
        if !thread::panicking() {
            self.flush();
        }
    }
}

/// Echo a command: the full form at verbosity 2 and up, an abbreviated
/// form at verbosity 1.
pub fn echo_command(verbosity: u8, full: impl Display, short: impl Display) {
    if verbosity >= 2 {
        println!("{full}");
    } else if verbosity == 1 {
        println!("{short}");
    }
}

/// "update file{x}" / "configure updating file{x}".
pub fn diag_do(action: Action, target: &Target) -> String {
    let mi = meta_operation_info(action.meta_operation());
    let oi = operation_info(action.operation());

    if mi.name_do.is_empty() {
        format!("{} {target}", oi.name_do)
    } else if oi.name_doing.is_empty() {
        format!("{} {target}", mi.name_do)
    } else {
        format!("{} {} {target}", mi.name_do, oi.name_doing)
    }
}

/// "updating file{x}" / "configuring updating file{x}".
pub fn diag_doing(action: Action, target: &Target) -> String {
    let mi = meta_operation_info(action.meta_operation());
    let oi = operation_info(action.operation());

    match (mi.name_doing.is_empty(), oi.name_doing.is_empty()) {
        (false, false) => format!("{} {} {target}", mi.name_doing, oi.name_doing),
        (false, true) => format!("{} {target}", mi.name_doing),
        (true, false) => format!("{} {target}", oi.name_doing),
        (true, true) => target.to_string(),
    }
}

/// "file{x} is up to date".
pub fn diag_done(action: Action, target: &Target) -> String {
    let oi = operation_info(action.operation());

    format!("{target} {}", oi.name_done)
}
