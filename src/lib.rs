// SPDX-License-Identifier: BSD-3-Clause

//! A FUSE file system exposing the files a checkpointed process had open. Each file is a
//! placeholder until it is first read or written, at which point it is copied from the host the
//! process was checkpointed on.

pub mod error;
pub mod filesystem;
pub mod fuse;
pub mod images;
pub mod lazy;
pub mod oslib;
pub mod registry;
pub mod util;

pub use error::{Error, Result};
pub use filesystem::{CachePolicy, Config, LazyFs};
pub use lazy::{Fetcher, LazyFile, RemoteAddress, ScpFetcher};
pub use registry::FileRegistry;
