// SPDX-License-Identifier: BSD-3-Clause

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Checkpoint image bytes that cannot be framed or decoded.
    #[error("malformed image: {reason}")]
    MalformedImage { reason: String },

    #[error("cannot build file registry from {image}: {source}")]
    RegistryBuild {
        image: String,
        #[source]
        source: Box<Error>,
    },

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("fetching {path:?} from the origin host failed: {source}")]
    FetchFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot open fetched copy {path:?}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn malformed<S: Into<String>>(reason: S) -> Self {
        Error::MalformedImage {
            reason: reason.into(),
        }
    }

    /// The errno reported back to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::Unsupported(_) => libc::ENOSYS,
            Error::OpenFailed { source, .. } | Error::Io(source) => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            Error::MalformedImage { .. } | Error::RegistryBuild { .. } | Error::FetchFailed { .. } => {
                libc::EIO
            }
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::malformed(format!("record does not match its schema: {err}"))
    }
}
