// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scoped redirection of the process's standard output descriptor.
//!
//! Some engine calls print diagnostics straight to file descriptor 1. The
//! guard here points fd 1 somewhere else for the duration of a scope and
//! puts the original back on every exit path. fd 1 is process-global, so
//! callers must not overlap redirections from different threads.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tracing::warn;

const STDOUT_FD: RawFd = libc::STDOUT_FILENO;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Keeps fd 1 pointed at another descriptor until dropped or restored.
pub struct StdoutRedirect {
    saved: Option<OwnedFd>,
}

impl StdoutRedirect {
    /// Flush pending stdout output, then point fd 1 at `target`.
    pub fn to(target: BorrowedFd<'_>) -> io::Result<Self> {
        io::stdout().flush()?;

        // SAFETY: dup on a descriptor the process owns for its lifetime
        let saved = cvt(unsafe { libc::dup(STDOUT_FD) })?;
        // SAFETY: `saved` was just returned by dup and is owned by nobody else
        let saved = unsafe { OwnedFd::from_raw_fd(saved) };

        // SAFETY: both descriptors are open; dup2 does not take ownership
        cvt(unsafe { libc::dup2(target.as_raw_fd(), STDOUT_FD) })?;

        Ok(StdoutRedirect { saved: Some(saved) })
    }

    /// Put the original stdout back, reporting failures.
    pub fn restore(mut self) -> io::Result<()> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> io::Result<()> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        let flushed = io::stdout().flush();
        // SAFETY: `saved` is a valid descriptor owned by this guard
        cvt(unsafe { libc::dup2(saved.as_raw_fd(), STDOUT_FD) })?;
        flushed
    }
}

impl Drop for StdoutRedirect {
    fn drop(&mut self) {
        if let Err(err) = self.restore_inner() {
            warn!(error = %err, "Failed to restore standard output");
        }
    }
}

/// Run `f` with standard output captured into an anonymous temporary file
/// and return its result together with everything written to fd 1.
pub fn capture_stdout<T>(f: impl FnOnce() -> T) -> io::Result<(T, String)> {
    let mut sink: File = tempfile::tempfile()?;
    let guard = StdoutRedirect::to(sink_fd(&sink))?;
    let value = f();
    guard.restore()?;

    sink.seek(SeekFrom::Start(0))?;
    let mut captured = String::new();
    sink.read_to_string(&mut captured)?;
    Ok((value, captured))
}

fn sink_fd(file: &File) -> BorrowedFd<'_> {
    use std::os::fd::AsFd;
    file.as_fd()
}
