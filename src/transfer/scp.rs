//! SCP copy over an SSH link
//!
//! `scp :remote local` downloads, `scp local :remote` uploads. Either side
//! may be a wildcard: remote names are expanded with `ls -1d` on the host,
//! local names with [`glob`].

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use super::{base_name, has_wildcard, send_all, ChannelIo, TransferError, Transferred};
use crate::transport::ssh::link::LinkChannel;
use crate::transport::ssh::SshLink;
use crate::transport::Frontend;

/// Bytes moved per channel call
const CHUNK: usize = 32 * 1024;

/// Permissions for uploaded files
const UPLOAD_MODE: i32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpJob {
    Download { remote: String, local: String },
    Upload { local: String, remote: String },
}

impl ScpJob {
    /// Parse `src dst`; exactly one side carries the `:` remote prefix
    pub fn parse(args: &str) -> Result<Self, TransferError> {
        const USAGE: &str = "scp :remote [local] | scp local :[remote]";
        let mut words = args.split_whitespace();
        let (Some(src), dst, None) = (words.next(), words.next(), words.next()) else {
            return Err(TransferError::Usage(USAGE));
        };
        let dst = dst.unwrap_or("");
        match (src.strip_prefix(':'), dst.strip_prefix(':')) {
            (Some(remote), None) if !remote.is_empty() => Ok(ScpJob::Download {
                remote: remote.to_string(),
                local: dst.to_string(),
            }),
            (None, Some(remote)) => Ok(ScpJob::Upload {
                local: src.to_string(),
                remote: remote.to_string(),
            }),
            _ => Err(TransferError::Usage(USAGE)),
        }
    }
}

/// Run a job, printing one summary line per file into `out`
pub fn run(link: &SshLink, job: &ScpJob, out: &dyn Frontend) -> Result<Vec<Transferred>, TransferError> {
    let mut done = Vec::new();
    match job {
        ScpJob::Download { remote, local } => {
            let sources = if has_wildcard(remote) {
                remote_list(link, remote)?
            } else {
                vec![remote.clone()]
            };
            let many = sources.len() > 1;
            for source in &sources {
                let target = local_target(local, source, many);
                let t = download(link, source, &target)?;
                out.print(&format!("{}\n", t));
                done.push(t);
            }
        }
        ScpJob::Upload { local, remote } => {
            let sources = local_list(local)?;
            let many = sources.len() > 1;
            for source in &sources {
                let target = remote_target(remote, source, many);
                let t = upload(link, source, &target)?;
                out.print(&format!("{}\n", t));
                done.push(t);
            }
        }
    }
    Ok(done)
}

/// Where a downloaded file lands
fn local_target(local: &str, remote: &str, many: bool) -> PathBuf {
    let local = if local.is_empty() { "." } else { local };
    let path = PathBuf::from(local);
    if many || path.is_dir() {
        path.join(base_name(remote))
    } else {
        path
    }
}

/// Where an uploaded file lands on the host
fn remote_target(remote: &str, local: &Path, many: bool) -> String {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if remote.is_empty() {
        name
    } else if many || remote.ends_with('/') {
        format!("{}/{}", remote.trim_end_matches('/'), name)
    } else {
        remote.to_string()
    }
}

fn local_list(pattern: &str) -> Result<Vec<PathBuf>, TransferError> {
    if !has_wildcard(pattern) {
        return Ok(vec![PathBuf::from(pattern)]);
    }
    let not_found = || TransferError::LocalOpen {
        path: PathBuf::from(pattern),
        source: std::io::ErrorKind::NotFound.into(),
    };
    let paths: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|_| not_found())?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    if paths.is_empty() {
        return Err(not_found());
    }
    Ok(paths)
}

/// Names printed by `ls -1d`, one per line
fn parse_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("ls:"))
        .map(str::to_string)
        .collect()
}

fn remote_list(link: &SshLink, pattern: &str) -> Result<Vec<String>, TransferError> {
    let open_err = |reason: String| TransferError::RemoteOpen {
        path: pattern.to_string(),
        reason,
    };
    let channel = link
        .retry(|session, _| session.channel_session())
        .map_err(|e| open_err(e.to_string()))?;
    let mut channel = LinkChannel::new(link, channel);
    let command = format!("ls -1d {}", pattern);
    channel
        .retry(|ch| ch.exec(&command))
        .map_err(|e| open_err(e.to_string()))?;

    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match channel.with(|ch| ch.read(&mut buf)) {
            Some(Ok(0)) if channel.eof() => break,
            Some(Ok(n)) => output.extend_from_slice(&buf[..n]),
            Some(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => link.wait(),
            Some(Err(e)) => return Err(open_err(e.to_string())),
            None => break,
        }
        if link.is_closed() {
            return Err(TransferError::Aborted);
        }
    }
    let names = parse_listing(&String::from_utf8_lossy(&output));
    if names.is_empty() {
        return Err(open_err("no such file".into()));
    }
    Ok(names)
}

fn download(link: &SshLink, remote: &str, local: &Path) -> Result<Transferred, TransferError> {
    let start = Instant::now();
    let (channel, stat) = link
        .retry(|session, _| session.scp_recv(Path::new(remote)))
        .map_err(|e| TransferError::RemoteOpen {
            path: remote.to_string(),
            reason: e.to_string(),
        })?;
    let mut channel = LinkChannel::new(link, channel);
    let mut file = File::create(local).map_err(|source| TransferError::LocalOpen {
        path: local.to_path_buf(),
        source,
    })?;

    let done = receive_file(&mut channel, &mut file, stat.size())?;
    let t = Transferred {
        name: base_name(remote).to_string(),
        bytes: done,
        elapsed: start.elapsed(),
    };
    info!("scp get {} -> {}: {} bytes", remote, local.display(), done);
    Ok(t)
}

fn upload(link: &SshLink, local: &Path, remote: &str) -> Result<Transferred, TransferError> {
    let start = Instant::now();
    let local_err = |source| TransferError::LocalOpen {
        path: local.to_path_buf(),
        source,
    };
    let size = fs::metadata(local).map_err(local_err)?.len();
    let mut file = File::open(local).map_err(local_err)?;
    let channel = link
        .retry(|session, _| session.scp_send(Path::new(remote), UPLOAD_MODE, size, None))
        .map_err(|e| TransferError::RemoteOpen {
            path: remote.to_string(),
            reason: e.to_string(),
        })?;
    let mut channel = LinkChannel::new(link, channel);
    let done = send_file(&mut channel, &mut file)?;
    info!("scp put {} -> {}: {} bytes", local.display(), remote, done);
    Ok(Transferred {
        name: remote_target("", local, false),
        bytes: done,
        elapsed: start.elapsed(),
    })
}

/// Copy exactly `size` bytes of file body from the channel into `out`
fn receive_file(channel: &mut dyn ChannelIo, out: &mut dyn Write, size: u64) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; CHUNK];
    let mut done = 0u64;
    while done < size {
        let want = (size - done).min(CHUNK as u64) as usize;
        let n = channel
            .recv(&mut buf[..want])
            .map_err(|e| interrupted(done, e))?;
        if n == 0 {
            return Err(interrupted(done, "connection closed"));
        }
        out.write_all(&buf[..n]).map_err(|e| interrupted(done, e))?;
        done += n as u64;
    }
    Ok(done)
}

/// Stream `input` into the channel in `CHUNK` pieces, then close the body
fn send_file(channel: &mut dyn ChannelIo, input: &mut dyn Read) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; CHUNK];
    let mut done = 0u64;
    loop {
        let n = input.read(&mut buf).map_err(|e| interrupted(done, e))?;
        if n == 0 {
            break;
        }
        send_all(channel, &buf[..n]).map_err(|e| interrupted(done, e))?;
        done += n as u64;
    }
    if let Err(e) = channel.finish() {
        warn!("scp end of file not acknowledged after {} bytes: {}", done, e);
    }
    Ok(done)
}

fn interrupted(bytes: u64, reason: impl ToString) -> TransferError {
    TransferError::Interrupted {
        bytes,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::tests::FakeChannel;

    #[test]
    fn test_parse_direction() {
        assert_eq!(
            ScpJob::parse(":/var/log/messages logs").unwrap(),
            ScpJob::Download {
                remote: "/var/log/messages".into(),
                local: "logs".into()
            }
        );
        assert_eq!(
            ScpJob::parse("fw.bin :/tmp/").unwrap(),
            ScpJob::Upload {
                local: "fw.bin".into(),
                remote: "/tmp/".into()
            }
        );
        assert_eq!(
            ScpJob::parse(":config.txt").unwrap(),
            ScpJob::Download {
                remote: "config.txt".into(),
                local: String::new()
            }
        );
    }

    #[test]
    fn test_parse_rejects_ambiguous() {
        assert!(ScpJob::parse("a b").is_err());
        assert!(ScpJob::parse(":a :b").is_err());
        assert!(ScpJob::parse("").is_err());
        assert!(ScpJob::parse("a :b c").is_err());
    }

    #[test]
    fn test_targets() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();
        assert_eq!(local_target(dir_str, "/etc/hosts", false), dir.path().join("hosts"));
        assert_eq!(local_target("copy.txt", "/etc/hosts", false), PathBuf::from("copy.txt"));
        assert_eq!(local_target("", "/etc/hosts", false), PathBuf::from(".").join("hosts"));

        let local = Path::new("build/fw.bin");
        assert_eq!(remote_target("", local, false), "fw.bin");
        assert_eq!(remote_target("/tmp/", local, false), "/tmp/fw.bin");
        assert_eq!(remote_target("/tmp/new.bin", local, false), "/tmp/new.bin");
        assert_eq!(remote_target("/tmp", local, true), "/tmp/fw.bin");
    }

    #[test]
    fn test_local_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.cfg"), "a").unwrap();
        fs::write(dir.path().join("b.cfg"), "b").unwrap();
        fs::write(dir.path().join("c.txt"), "c").unwrap();
        let pattern = format!("{}/*.cfg", dir.path().display());
        let mut found = local_list(&pattern).unwrap();
        found.sort();
        assert_eq!(found, vec![dir.path().join("a.cfg"), dir.path().join("b.cfg")]);

        let none = format!("{}/*.bin", dir.path().display());
        assert!(matches!(local_list(&none), Err(TransferError::LocalOpen { .. })));
    }

    #[test]
    fn test_listing_output() {
        let out = "/var/log/a.log\n/var/log/b.log\n\nls: cannot access 'x': No such file\n";
        assert_eq!(parse_listing(out), vec!["/var/log/a.log", "/var/log/b.log"]);
    }

    #[test]
    fn test_receive_stops_at_announced_size() {
        let mut channel = FakeChannel::new(&[b"hello ", b"world", b"trailing status"]);
        let mut out = Vec::new();
        assert_eq!(receive_file(&mut channel, &mut out, 11).unwrap(), 11);
        assert_eq!(out, b"hello world");
        assert_eq!(channel.incoming.len(), 1);
    }

    #[test]
    fn test_receive_reports_short_body() {
        let mut channel = FakeChannel::new(&[b"partial"]);
        let mut out = Vec::new();
        let err = receive_file(&mut channel, &mut out, 100).unwrap_err();
        assert!(matches!(err, TransferError::Interrupted { bytes: 7, .. }));
        assert_eq!(out, b"partial");
    }

    #[test]
    fn test_send_chunks_and_closes() {
        let body: Vec<u8> = (0..CHUNK * 2 + 100).map(|i| i as u8).collect();
        let mut channel = FakeChannel::new(&[]);
        channel.max_write = CHUNK / 2 + 1;
        let sent = send_file(&mut channel, &mut body.as_slice()).unwrap();
        assert_eq!(sent, body.len() as u64);
        assert_eq!(channel.sent_bytes(), body);
        assert!(channel.sent.iter().all(|w| w.len() <= CHUNK / 2 + 1));
        assert!(channel.finished);
    }

    #[test]
    fn test_empty_file_still_closes() {
        let mut channel = FakeChannel::new(&[]);
        assert_eq!(send_file(&mut channel, &mut &b""[..]).unwrap(), 0);
        assert!(channel.sent.is_empty());
        assert!(channel.finished);
    }
}
