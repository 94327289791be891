// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Modification times with the two sentinel values the engine cares
//! about: "the file does not exist" and "not probed yet".

use std::{path::Path, time::SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    /// The file is known not to exist.
    Nonexistent,
    /// Not yet determined.
    Unknown,
    At(SystemTime),
}

impl Timestamp {
    pub fn now() -> Self {
        Timestamp::At(SystemTime::now())
    }

    pub fn is_nonexistent(&self) -> bool {
        matches!(self, Timestamp::Nonexistent)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Timestamp::Unknown)
    }

    /// True if `self` is a real timestamp strictly newer than `other`.
    /// Sentinels never compare newer.
    pub fn newer_than(&self, other: &Timestamp) -> bool {
        match (self, other) {
            (Timestamp::At(a), Timestamp::At(b)) => a > b,
            // A real file is newer than one that does not exist.
            (Timestamp::At(_), Timestamp::Nonexistent) => true,
            _ => false,
        }
    }
}

/// Probe the modification time of `path`. A missing file maps to
/// [`Timestamp::Nonexistent`]; any other error is surfaced as `Unknown`
/// so that the caller's staleness logic stays conservative.
pub fn file_mtime(path: &Path) -> Timestamp {
    match fs_err::metadata(path) {
        Ok(meta) => meta.modified().map(Timestamp::At).unwrap_or(Timestamp::Unknown),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Timestamp::Nonexistent,
        Err(_) => Timestamp::Unknown,
    }
}
