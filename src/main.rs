// SPDX-License-Identifier: BSD-3-Clause

use clap::Parser;
use lazyfs::fuse::{self, MountConfig};
use lazyfs::{CachePolicy, Config, FileRegistry, LazyFs, RemoteAddress, ScpFetcher};
use log::{error, LevelFilter};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "lazyfs", version)]
#[command(about = "Serve the open files of a checkpointed process, fetching each on first access")]
struct Opt {
    /// Directory to mount the file system on
    mountpoint: PathBuf,

    /// Checkpoint image directory holding `fdinfo-*.img` and `reg-files.img`
    imgdir: PathBuf,

    /// Host the process was checkpointed on, as `[user@]host[:port]` (IPv6 as `[addr]`)
    remote: RemoteAddress,

    /// Caching policy reported to the kernel: never, auto or always
    #[arg(long, default_value = "auto")]
    cache: CachePolicy,

    /// Worker threads for requests that may wait on a fetch, 0 to serve them inline
    #[arg(long, default_value_t = 4)]
    thread_pool_size: usize,

    /// Command used to copy a file from the origin host, called like scp
    #[arg(long, default_value = "scp")]
    fetch_command: String,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Log level; RUST_LOG takes precedence when logging to stderr
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Log to syslog instead of stderr
    #[arg(long)]
    syslog: bool,
}

fn initialize_logging(opt: &Opt) {
    if opt.syslog {
        if let Err(e) = syslog::init(syslog::Facility::LOG_USER, opt.log_level, Some("lazyfs")) {
            eprintln!("lazyfs: cannot connect to syslog: {e}");
            process::exit(1);
        }
    } else {
        let filter = opt.log_level.to_string();
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
    }
}

fn run(opt: Opt) -> lazyfs::Result<()> {
    let registry = FileRegistry::from_image_dir(&opt.imgdir)?;
    let fetcher = ScpFetcher::new(opt.remote).with_command(&opt.fetch_command)?;

    let cfg = Config {
        cache_policy: opt.cache,
        thread_pool_size: opt.thread_pool_size,
        ..Default::default()
    };
    let fs = LazyFs::new(Arc::new(registry), Arc::new(fetcher), cfg);

    let mount_cfg = MountConfig {
        allow_other: opt.allow_other,
    };
    fuse::mount(fs, &opt.mountpoint, &mount_cfg)?;
    Ok(())
}

fn main() {
    let opt = Opt::parse();
    initialize_logging(&opt);

    let syslog = opt.syslog;
    if let Err(e) = run(opt) {
        error!("{e}");
        if syslog {
            eprintln!("lazyfs: {e}");
        }
        process::exit(1);
    }
}
