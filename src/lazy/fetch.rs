// SPDX-License-Identifier: BSD-3-Clause

use crate::util::{other_io_error, ResultErrorContext};
use log::{debug, info};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;

/// Suffix of the temporary a transfer writes to before it is renamed into place.
pub const PARTIAL_SUFFIX: &str = ".lazyfs-partial";

/// The origin host, given as `[user@]host[:port]` at mount time. IPv6 literals go in brackets,
/// as in `[::1]:22`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddress {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl FromStr for RemoteAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, rest) = match s.split_once('@') {
            Some((user, _)) if user.is_empty() => return Err(format!("empty user in {s:?}")),
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, s),
        };
        let (host, port) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (host, after) = bracketed
                    .split_once(']')
                    .ok_or_else(|| format!("unclosed '[' in {s:?}"))?;
                match after {
                    "" => (host, None),
                    _ => match after.strip_prefix(':') {
                        Some(port) => (host, Some(port)),
                        None => return Err(format!("unexpected {after:?} after host in {s:?}")),
                    },
                }
            }
            None => match rest.split_once(':') {
                Some((_, port)) if port.contains(':') => {
                    return Err(format!("IPv6 address in {s:?} needs brackets, e.g. [::1]"))
                }
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            },
        };
        let port = port
            .map(|port| {
                port.parse::<u16>()
                    .map_err(|e| format!("invalid port {port:?}: {e}"))
            })
            .transpose()?;
        if host.is_empty() {
            return Err(format!("missing host in {s:?}"));
        }
        Ok(RemoteAddress {
            user,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        // scp wants IPv6 literals bracketed.
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)
        } else {
            write!(f, "{}", self.host)
        }
    }
}

/// Copies one file from the origin host to the identical path on this host.
///
/// On success the file exists locally with its complete contents. On failure nothing may be left
/// under the final path that a later attempt could mistake for a finished copy.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, remote_path: &Path, mode: u32) -> io::Result<()>;
}

/// Fetches over `scp(1)`, or any command taking the same arguments.
pub struct ScpFetcher {
    remote: RemoteAddress,
    program: String,
    extra_args: Vec<String>,
}

impl ScpFetcher {
    pub fn new(remote: RemoteAddress) -> Self {
        ScpFetcher {
            remote,
            program: "scp".to_string(),
            extra_args: Vec::new(),
        }
    }

    /// Replaces the transfer command, e.g. `scp -o BatchMode=yes`. The words are split like a
    /// shell would.
    pub fn with_command(mut self, command: &str) -> io::Result<Self> {
        let mut words = shlex::split(command)
            .filter(|w| !w.is_empty())
            .ok_or_else(|| other_io_error(format!("cannot parse fetch command {command:?}")))?
            .into_iter();
        self.program = words
            .next()
            .ok_or_else(|| other_io_error("empty fetch command"))?;
        self.extra_args = words.collect();
        Ok(self)
    }

    pub fn remote(&self) -> &RemoteAddress {
        &self.remote
    }

    fn command(&self, remote_path: &Path, local_path: &Path) -> Command {
        let mut source = OsString::from(format!("{}:", self.remote));
        source.push(remote_path);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args);
        if let Some(port) = self.remote.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd.arg(source).arg(local_path);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn transfer(&self, remote_path: &Path, partial: &Path, mode: u32) -> io::Result<()> {
        let mut cmd = self.command(remote_path, partial);
        debug!("fetch: {:?}", cmd);
        let status = cmd.status().err_context(|| &self.program)?;
        if !status.success() {
            return Err(other_io_error(format!("{} {status}", self.program)));
        }
        fs::set_permissions(partial, fs::Permissions::from_mode(mode & 0o7777))?;
        fs::rename(partial, remote_path)
    }
}

pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    PathBuf::from(partial)
}

impl Fetcher for ScpFetcher {
    fn fetch(&self, remote_path: &Path, mode: u32) -> io::Result<()> {
        if let Some(parent) = remote_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = partial_path(remote_path);

        info!("fetching {}:{}", self.remote, remote_path.display());
        let res = self.transfer(remote_path, &partial, mode);
        if res.is_err() {
            // The transfer may have left a truncated copy behind.
            let _ = fs::remove_file(&partial);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_addresses() {
        assert_eq!(
            "host".parse::<RemoteAddress>().unwrap(),
            RemoteAddress {
                user: None,
                host: "host".into(),
                port: None
            }
        );
        let full: RemoteAddress = "criu@10.0.0.2:2222".parse().unwrap();
        assert_eq!(full.user.as_deref(), Some("criu"));
        assert_eq!(full.host, "10.0.0.2");
        assert_eq!(full.port, Some(2222));
        assert_eq!(full.to_string(), "criu@10.0.0.2");

        assert!("".parse::<RemoteAddress>().is_err());
        assert!("@host".parse::<RemoteAddress>().is_err());
        assert!("host:ssh".parse::<RemoteAddress>().is_err());
        assert!("user@:22".parse::<RemoteAddress>().is_err());
    }

    #[test]
    fn ipv6_hosts_need_brackets() {
        assert!("::1".parse::<RemoteAddress>().is_err());
        assert!("criu@fe80::1".parse::<RemoteAddress>().is_err());
        assert!("[::1".parse::<RemoteAddress>().is_err());
        assert!("[::1]22".parse::<RemoteAddress>().is_err());
        assert!("[]:22".parse::<RemoteAddress>().is_err());

        let local: RemoteAddress = "[::1]".parse().unwrap();
        assert_eq!(local.host, "::1");
        assert_eq!(local.port, None);
        assert_eq!(local.to_string(), "[::1]");

        let full: RemoteAddress = "criu@[fe80::1]:2222".parse().unwrap();
        assert_eq!(full.user.as_deref(), Some("criu"));
        assert_eq!(full.host, "fe80::1");
        assert_eq!(full.port, Some(2222));

        let fetcher = ScpFetcher::new(full);
        let cmd = fetcher.command(Path::new("/srv/db"), Path::new("/tmp/x"));
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["-P", "2222", "criu@[fe80::1]:/srv/db", "/tmp/x"]);
    }

    #[test]
    fn builds_scp_arguments() {
        let fetcher = ScpFetcher::new("me@origin:2200".parse().unwrap())
            .with_command("scp -q -o 'BatchMode yes'")
            .unwrap();
        let cmd = fetcher.command(Path::new("/var/log/app.log"), Path::new("/tmp/x"));
        assert_eq!(cmd.get_program(), "scp");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(
            args,
            ["-q", "-o", "BatchMode yes", "-P", "2200", "me@origin:/var/log/app.log", "/tmp/x"]
        );
    }

    #[test]
    fn rejects_empty_commands() {
        let remote: RemoteAddress = "origin".parse().unwrap();
        assert!(ScpFetcher::new(remote.clone()).with_command("").is_err());
        assert!(ScpFetcher::new(remote).with_command("scp 'unterminated").is_err());
    }

    #[test]
    fn failed_transfer_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub/data.bin");
        // `false` ignores its arguments and fails.
        let fetcher = ScpFetcher::new("origin".parse().unwrap())
            .with_command("false")
            .unwrap();

        assert!(fetcher.fetch(&target, 0o644).is_err());
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[test]
    fn successful_transfer_is_renamed_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");
        // `cp` takes scp's argument layout; the "host:" prefix points into a local directory.
        let origin = dir.path().join("origin:");
        fs::create_dir_all(origin.join(dir.path().strip_prefix("/").unwrap())).unwrap();
        fs::write(origin.join(target.strip_prefix("/").unwrap()), b"payload").unwrap();

        let fetcher = ScpFetcher::new(
            RemoteAddress {
                user: None,
                host: origin.parent().unwrap().join("origin").display().to_string(),
                port: None,
            },
        )
        .with_command("cp")
        .unwrap();

        fetcher.fetch(&target, 0o600).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
        assert_eq!(
            fs::metadata(&target).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert!(!partial_path(&target).exists());
    }
}
