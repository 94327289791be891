// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Auxiliary dependency database, used by recipes to detect changes that
//! mtime comparison cannot see (command lines, compiler versions, ...).
//!
//! The database is a line-oriented file. The first line holds the format
//! version, subsequent lines are free-form and stored in invalidation
//! order: if an earlier line has changed then all later lines are
//! presumed invalid. A single NUL byte acts as the end marker; its
//! absence means a previous write was interrupted and the file content
//! after the last confirmed line cannot be trusted.
//!
//! A database opens in read mode when the file exists and transparently
//! switches to write mode on the first mismatch (truncating at the start
//! of the mismatched line). See [`Database::expect`] for the canonical
//! check-one-line step.

use std::{
    io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

use fs_err::{File, OpenOptions};
use thiserror::Error;

/// Current format version, stored as the first line.
const VERSION: &str = "1";

/// The end marker. A database without it is considered interrupted.
const END_MARKER: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Lines are being read and verified against the file.
    Reading,
    /// The end marker was reached; every line in the file is confirmed.
    ReadEof,
    /// Reading is over, new lines are being appended.
    Writing,
}

enum Stream {
    Read(BufReader<File>),
    Write(BufWriter<File>),
}

/// An open dependency database.
pub struct Database {
    path: PathBuf,
    stream: Option<Stream>,
    state: State,
    /// Byte offset of the start of the most recently read line. This is
    /// where the file is truncated when switching to write mode.
    pos: u64,
    /// Byte offset just past the last fully consumed line.
    next_pos: u64,
    line: String,
    mtime: Option<SystemTime>,
    /// Request an mtime refresh on close even if no line changed.
    pub touch: bool,
}

impl Database {
    /// Open the database at `path`, in read mode if the file exists and
    /// in write mode otherwise. The format version line is consumed (or
    /// written) before this returns; a version mismatch invalidates the
    /// whole file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();

        let mtime = fs_err::metadata(&path).and_then(|m| m.modified()).ok();

        let mut db = if mtime.is_some() {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;

            Self {
                path,
                stream: Some(Stream::Read(BufReader::new(file))),
                state: State::Reading,
                pos: 0,
                next_pos: 0,
                line: String::new(),
                mtime,
                touch: false,
            }
        } else {
            let file = OpenOptions::new().write(true).create_new(true).open(&path)?;

            Self {
                path,
                stream: Some(Stream::Write(BufWriter::new(file))),
                state: State::Writing,
                pos: 0,
                next_pos: 0,
                line: String::new(),
                mtime: None,
                touch: false,
            }
        };

        match db.state {
            State::Reading => {
                if db.read()? != Some(VERSION) {
                    db.write(VERSION)?;
                }
            }
            _ => db.write(VERSION)?,
        }

        Ok(db)
    }

    /// True until the first write (or detected corruption).
    pub fn reading(&self) -> bool {
        matches!(self.state, State::Reading | State::ReadEof)
    }

    pub fn writing(&self) -> bool {
        self.state == State::Writing
    }

    /// Modification time of the file as opened. `None` once any line has
    /// been (or is about to be) rewritten.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    /// Read the next line, or `None` at the end of the confirmed content.
    ///
    /// Reaching the end of file without seeing the end marker means an
    /// earlier write was interrupted; the database silently switches to
    /// write mode positioned at the start of the offending line.
    pub fn read(&mut self) -> Result<Option<&str>, Error> {
        // Remember where this line starts so that a subsequent write can
        // overwrite it.
        self.pos = self.next_pos;

        match self.state {
            State::ReadEof | State::Writing => return Ok(None),
            State::Reading => {}
        }

        let Some(Stream::Read(reader)) = self.stream.as_mut() else {
            return Ok(None);
        };

        let mut buf = Vec::new();
        let n = reader.read_until(b'\n', &mut buf)?;

        // A line must end in a newline and be followed by either another
        // line or the end marker. Anything else is corruption.
        if n == 0 || buf.last() != Some(&b'\n') {
            self.change(true)?;
            return Ok(None);
        }

        let next = {
            let peek = reader.fill_buf()?;
            peek.first().copied()
        };

        let Some(next) = next else {
            self.change(true)?;
            return Ok(None);
        };

        self.next_pos += n as u64;

        if next == END_MARKER {
            self.state = State::ReadEof;
        }

        buf.pop();

        match String::from_utf8(buf) {
            Ok(line) => {
                self.line = line;
                Ok(Some(&self.line))
            }
            // Non-UTF-8 content can only come from an interrupted or
            // foreign write. Treat it like any other corruption.
            Err(_) => {
                self.change(true)?;
                Ok(None)
            }
        }
    }

    /// The canonical verification step: read the next line and compare it
    /// to `line`. On a match, nothing happens and `None` is returned. On
    /// a mismatch, `line` replaces the old content and the superseded
    /// line (if any) is returned so the caller can log what triggered the
    /// update. A mismatch against a missing line also returns `None`;
    /// [`writing`](Self::writing) is what tells the two cases apart.
    pub fn expect(&mut self, line: &str) -> Result<Option<String>, Error> {
        let old = self.read()?.map(ToOwned::to_owned);

        if old.as_deref() == Some(line) {
            return Ok(None);
        }

        self.write(line)?;

        Ok(old)
    }

    /// Fast-forward over the remaining lines. Returns true if the end
    /// marker was found (all content confirmed); otherwise the database
    /// has switched to write mode.
    pub fn skip(&mut self) -> Result<bool, Error> {
        if self.state == State::ReadEof {
            return Ok(true);
        }

        assert_eq!(self.state, State::Reading);

        self.pos = self.next_pos;

        // Scan for "\n\0", counting consumed bytes so close() can accept
        // everything up to (but not including) the end marker.
        let (found, consumed) = {
            let Some(Stream::Read(reader)) = self.stream.as_mut() else {
                return Ok(false);
            };

            let mut consumed = 0u64;
            let mut at_newline = false;
            let mut found = false;

            for byte in reader.bytes() {
                let byte = byte?;
                consumed += 1;

                if at_newline && byte == END_MARKER {
                    found = true;
                    break;
                }

                at_newline = byte == b'\n';
            }

            (found, consumed)
        };

        if found {
            self.state = State::ReadEof;
            self.next_pos += consumed - 1;
            return Ok(true);
        }

        // No end marker: invalid tail, switch over to writing.
        self.change(true)?;
        Ok(false)
    }

    /// Append a line, first switching to write mode (truncating at the
    /// start of the last read line) if still reading.
    pub fn write(&mut self, line: &str) -> Result<(), Error> {
        if self.state != State::Writing {
            self.change(true)?;
        }

        let Some(Stream::Write(writer)) = self.stream.as_mut() else {
            unreachable!("write stream after change()");
        };

        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;

        Ok(())
    }

    /// Switch from reading to writing, positioned at the start of the
    /// last read line.
    fn change(&mut self, truncate: bool) -> Result<(), Error> {
        assert_ne!(self.state, State::Writing);

        let Some(Stream::Read(reader)) = self.stream.take() else {
            unreachable!("read stream before change()");
        };

        let mut file = reader.into_inner();

        // An interrupted overwrite must never combine a new-line prefix
        // with an old-line suffix into something that parses as valid, so
        // the stale tail is cut off before any writing starts.
        if truncate {
            file.set_len(self.pos)?;
        }

        file.seek(SeekFrom::Start(self.pos))?;

        self.stream = Some(Stream::Write(BufWriter::new(file)));
        self.state = State::Writing;
        self.mtime = None;

        Ok(())
    }

    /// Close the database, writing the end marker.
    ///
    /// If every line was read and confirmed the file is left untouched
    /// (unless `touch` was requested). Otherwise any unread tail is
    /// discarded and a fresh end marker written.
    pub fn close(mut self) -> Result<(), Error> {
        match self.state {
            State::ReadEof if !self.touch => return Ok(()),
            // Overwriting the end marker in place is the cheapest
            // portable way to refresh the mtime.
            State::ReadEof => {
                self.pos = self.next_pos;
                self.change(false)?;
            }
            State::Reading => {
                // Everything read so far is accepted.
                self.pos = self.next_pos;
                self.change(true)?;
            }
            State::Writing => {}
        }

        let Some(Stream::Write(mut writer)) = self.stream.take() else {
            unreachable!("write stream on close");
        };

        writer.write_all(&[END_MARKER])?;
        writer.flush()?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Guard against filesystems that assign a file's modification time when
/// the data hits the disk rather than at close: a database written after
/// its target must never end up with an earlier mtime.
pub fn verify_mtimes(db: &Path, target: &Path) -> Result<(), Error> {
    let db_mtime = fs_err::metadata(db)?.modified()?;
    let target_mtime = fs_err::metadata(target)?.modified()?;

    if db_mtime > target_mtime {
        return Err(Error::BackwardsMtime {
            db: db.to_path_buf(),
            target: target.to_path_buf(),
        });
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("backwards modification times between {db:?} and {target:?}")]
    BackwardsMtime { db: PathBuf, target: PathBuf },
}
