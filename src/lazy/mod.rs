// SPDX-License-Identifier: BSD-3-Clause

pub mod fetch;
pub mod file;

pub use fetch::{Fetcher, RemoteAddress, ScpFetcher};
pub use file::LazyFile;
