// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Errors raised while setting the runtime up.
//!
//! Failures of hooked POSIX calls never show up here; those go through
//! the usual `-1` + `errno` channel.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create epoll instance: {0}")]
    EpollCreate(#[source] io::Error),

    #[error("failed to create wakeup pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("epoll_ctl({op}) on fd {fd} failed: {source}")]
    EpollCtl {
        op: &'static str,
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// The errno behind this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::EpollCreate(e) | Error::Pipe(e) => e.raw_os_error(),
            Error::EpollCtl { source, .. } | Error::Spawn { source, .. } => source.raw_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
