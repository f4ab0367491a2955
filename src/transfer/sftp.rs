//! Interactive SFTP command set
//!
//! Each command maps to one or more calls on the SFTP subsystem. `get` and
//! `put` accept glob patterns in the last path component.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use ssh2::Sftp;
use tracing::{debug, info};

use super::{base_name, has_wildcard, TransferError, Transferred};
use crate::transport::Frontend;

const CHUNK: usize = 32 * 1024;

const HELP: &str = "\
ls [path]            list remote directory
cd path              change remote directory
pwd                  print remote directory
get remote [local]   download file(s)
put local [remote]   upload file(s)
rm path              delete remote file
mkdir path           create remote directory
rmdir path           remove remote directory
ren old new          rename remote file
lls [path]           list local directory
lcd path             change local directory
lpwd                 print local directory
bye                  end the session
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpCommand {
    Ls(Option<String>),
    Cd(String),
    Pwd,
    Get(String, Option<String>),
    Put(String, Option<String>),
    Rm(String),
    Mkdir(String),
    Rmdir(String),
    Ren(String, String),
    Lls(Option<String>),
    Lcd(String),
    Lpwd,
    Help,
    Bye,
}

impl SftpCommand {
    /// `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>, TransferError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let a = words.next().map(str::to_string);
        let b = words.next().map(str::to_string);
        let need = |arg: Option<String>, usage: &'static str| arg.ok_or(TransferError::Usage(usage));
        let command = match verb.to_ascii_lowercase().as_str() {
            "ls" | "dir" => Self::Ls(a),
            "cd" => Self::Cd(need(a, "cd path")?),
            "pwd" => Self::Pwd,
            "get" => Self::Get(need(a, "get remote [local]")?, b),
            "put" => Self::Put(need(a, "put local [remote]")?, b),
            "rm" | "del" => Self::Rm(need(a, "rm path")?),
            "mkdir" => Self::Mkdir(need(a, "mkdir path")?),
            "rmdir" => Self::Rmdir(need(a, "rmdir path")?),
            "ren" | "rename" => Self::Ren(need(a, "ren old new")?, need(b, "ren old new")?),
            "lls" => Self::Lls(a),
            "lcd" => Self::Lcd(need(a, "lcd path")?),
            "lpwd" => Self::Lpwd,
            "help" | "?" => Self::Help,
            "bye" | "quit" | "exit" => Self::Bye,
            other => return Err(TransferError::NotSupported(format!("unknown command: {}", other))),
        };
        Ok(Some(command))
    }
}

/// Resolve `path` against a remote working directory
pub fn join_remote(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if path == "." {
        cwd.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    }
}

/// Split a remote path into directory and last component
fn split_remote(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (".", path),
    }
}

/// `ls -l` style permission string
pub fn mode_string(perm: u32) -> String {
    let kind = match perm & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        _ => '-',
    };
    let mut s = String::with_capacity(10);
    s.push(kind);
    for shift in [6, 3, 0] {
        let bits = (perm >> shift) & 0o7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}

pub struct SftpShell<'a> {
    sftp: Sftp,
    out: &'a dyn Frontend,
    cwd: String,
    lcwd: PathBuf,
}

impl<'a> SftpShell<'a> {
    pub fn new(sftp: Sftp, out: &'a dyn Frontend) -> Self {
        let cwd = sftp
            .realpath(Path::new("."))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/".to_string());
        let lcwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { sftp, out, cwd, lcwd }
    }

    /// Run one command line; false once the user asked to leave
    pub fn execute(&mut self, line: &str) -> bool {
        let command = match SftpCommand::parse(line) {
            Ok(Some(c)) => c,
            Ok(None) => return true,
            Err(e) => {
                self.out.print(&format!("{}\n", e));
                return true;
            }
        };
        if command == SftpCommand::Bye {
            return false;
        }
        debug!("sftp {:?}", command);
        if let Err(e) = self.run(command) {
            self.out.print(&format!("{}\n", e));
        }
        true
    }

    fn run(&mut self, command: SftpCommand) -> Result<(), TransferError> {
        match command {
            SftpCommand::Ls(path) => self.ls(path.as_deref()),
            SftpCommand::Cd(path) => self.cd(&path),
            SftpCommand::Pwd => {
                self.out.print(&format!("{}\n", self.cwd));
                Ok(())
            }
            SftpCommand::Get(remote, local) => self.get(&remote, local.as_deref()),
            SftpCommand::Put(local, remote) => self.put(&local, remote.as_deref()),
            SftpCommand::Rm(path) => {
                let path = join_remote(&self.cwd, &path);
                self.sftp.unlink(Path::new(&path)).map_err(protocol)
            }
            SftpCommand::Mkdir(path) => {
                let path = join_remote(&self.cwd, &path);
                self.sftp.mkdir(Path::new(&path), 0o755).map_err(protocol)
            }
            SftpCommand::Rmdir(path) => {
                let path = join_remote(&self.cwd, &path);
                self.sftp.rmdir(Path::new(&path)).map_err(protocol)
            }
            SftpCommand::Ren(from, to) => {
                let from = join_remote(&self.cwd, &from);
                let to = join_remote(&self.cwd, &to);
                self.sftp
                    .rename(Path::new(&from), Path::new(&to), None)
                    .map_err(protocol)
            }
            SftpCommand::Lls(path) => self.lls(path.as_deref()),
            SftpCommand::Lcd(path) => self.lcd(&path),
            SftpCommand::Lpwd => {
                self.out.print(&format!("{}\n", self.lcwd.display()));
                Ok(())
            }
            SftpCommand::Help => {
                self.out.print(HELP);
                Ok(())
            }
            SftpCommand::Bye => Ok(()),
        }
    }

    fn ls(&self, path: Option<&str>) -> Result<(), TransferError> {
        let target = join_remote(&self.cwd, path.unwrap_or("."));
        let (dir, filter) = match split_remote(&target) {
            (dir, name) if has_wildcard(name) => (dir.to_string(), Some(pattern(name)?)),
            _ => (target.clone(), None),
        };
        let mut entries = self.sftp.readdir(Path::new(&dir)).map_err(protocol)?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut listing = String::new();
        for (path, stat) in entries {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if filter.as_ref().map_or(false, |p| !p.matches(&name)) {
                continue;
            }
            listing.push_str(&format!(
                "{} {:>12} {}\n",
                mode_string(stat.perm.unwrap_or(0)),
                stat.size.unwrap_or(0),
                name
            ));
        }
        self.out.print(&listing);
        Ok(())
    }

    fn cd(&mut self, path: &str) -> Result<(), TransferError> {
        let target = join_remote(&self.cwd, path);
        let real = self.sftp.realpath(Path::new(&target)).map_err(protocol)?;
        let stat = self.sftp.stat(&real).map_err(protocol)?;
        if !stat.is_dir() {
            return Err(TransferError::Protocol(format!("{} is not a directory", target)));
        }
        self.cwd = real.to_string_lossy().into_owned();
        Ok(())
    }

    fn lls(&self, path: Option<&str>) -> Result<(), TransferError> {
        let dir = path.map_or_else(|| self.lcwd.clone(), |p| self.lcwd.join(p));
        let entries = fs::read_dir(&dir).map_err(|source| TransferError::LocalOpen {
            path: dir.clone(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| {
                let mut name = e.file_name().to_string_lossy().into_owned();
                if e.path().is_dir() {
                    name.push('/');
                }
                name
            })
            .collect();
        names.sort();
        let mut listing = names.join("\n");
        listing.push('\n');
        self.out.print(&listing);
        Ok(())
    }

    fn lcd(&mut self, path: &str) -> Result<(), TransferError> {
        let target = self.lcwd.join(path);
        let real = fs::canonicalize(&target).map_err(|source| TransferError::LocalOpen {
            path: target.clone(),
            source,
        })?;
        if !real.is_dir() {
            return Err(TransferError::NotSupported(format!("{} is not a directory", real.display())));
        }
        self.lcwd = real;
        Ok(())
    }

    /// Remote files named by `spec`, expanding a wildcard last component
    fn remote_matches(&self, spec: &str) -> Result<Vec<String>, TransferError> {
        let full = join_remote(&self.cwd, spec);
        let (dir, name) = split_remote(&full);
        if !has_wildcard(name) {
            return Ok(vec![full.clone()]);
        }
        let pat = pattern(name)?;
        let mut found: Vec<String> = self
            .sftp
            .readdir(Path::new(dir))
            .map_err(protocol)?
            .into_iter()
            .filter(|(_, stat)| !stat.is_dir())
            .filter_map(|(path, _)| {
                let n = path.file_name()?.to_string_lossy().into_owned();
                pat.matches(&n).then(|| join_remote(dir, &n))
            })
            .collect();
        if found.is_empty() {
            return Err(TransferError::RemoteOpen {
                path: full,
                reason: "no match".into(),
            });
        }
        found.sort();
        Ok(found)
    }

    fn get(&self, spec: &str, dest: Option<&str>) -> Result<(), TransferError> {
        let sources = self.remote_matches(spec)?;
        let single = sources.len() == 1;
        for remote in &sources {
            let target = match dest {
                Some(d) => {
                    let d = self.lcwd.join(d);
                    if single && !d.is_dir() {
                        d
                    } else {
                        d.join(base_name(remote))
                    }
                }
                None => self.lcwd.join(base_name(remote)),
            };
            let t = self.download(remote, &target)?;
            self.out.print(&format!("{}\n", t));
        }
        Ok(())
    }

    fn put(&self, spec: &str, dest: Option<&str>) -> Result<(), TransferError> {
        let full = self.lcwd.join(spec);
        let sources: Vec<PathBuf> = if has_wildcard(spec) {
            let pattern = full.to_string_lossy().into_owned();
            glob::glob(&pattern)
                .map_err(|e| TransferError::NotSupported(e.to_string()))?
                .filter_map(Result::ok)
                .filter(|p| p.is_file())
                .collect()
        } else {
            vec![full.clone()]
        };
        if sources.is_empty() {
            return Err(TransferError::LocalOpen {
                path: full,
                source: std::io::ErrorKind::NotFound.into(),
            });
        }
        let single = sources.len() == 1;
        for local in &sources {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let target = match dest {
                Some(d) => {
                    let d = join_remote(&self.cwd, d);
                    let is_dir = self.sftp.stat(Path::new(&d)).map(|s| s.is_dir()).unwrap_or(false);
                    if single && !is_dir {
                        d
                    } else {
                        join_remote(&d, &name)
                    }
                }
                None => join_remote(&self.cwd, &name),
            };
            let t = self.upload(local, &target)?;
            self.out.print(&format!("{}\n", t));
        }
        Ok(())
    }

    fn download(&self, remote: &str, local: &Path) -> Result<Transferred, TransferError> {
        let start = Instant::now();
        let mut src = self.sftp.open(Path::new(remote)).map_err(|e| TransferError::RemoteOpen {
            path: remote.to_string(),
            reason: e.to_string(),
        })?;
        let mut dst = File::create(local).map_err(|source| TransferError::LocalOpen {
            path: local.to_path_buf(),
            source,
        })?;
        let bytes = copy(&mut src, &mut dst)?;
        info!("sftp get {} -> {}: {} bytes", remote, local.display(), bytes);
        Ok(Transferred {
            name: base_name(remote).to_string(),
            bytes,
            elapsed: start.elapsed(),
        })
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<Transferred, TransferError> {
        let start = Instant::now();
        let mut src = File::open(local).map_err(|source| TransferError::LocalOpen {
            path: local.to_path_buf(),
            source,
        })?;
        let mut dst = self.sftp.create(Path::new(remote)).map_err(|e| TransferError::RemoteOpen {
            path: remote.to_string(),
            reason: e.to_string(),
        })?;
        let bytes = copy(&mut src, &mut dst)?;
        info!("sftp put {} -> {}: {} bytes", local.display(), remote, bytes);
        Ok(Transferred {
            name: base_name(remote).to_string(),
            bytes,
            elapsed: start.elapsed(),
        })
    }
}

/// Copy in fixed chunks, reporting the byte count on failure
fn copy(src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; CHUNK];
    let mut done = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TransferError::Interrupted {
                    bytes: done,
                    reason: e.to_string(),
                })
            }
        };
        dst.write_all(&buf[..n]).map_err(|e| TransferError::Interrupted {
            bytes: done,
            reason: e.to_string(),
        })?;
        done += n as u64;
    }
    Ok(done)
}

fn pattern(name: &str) -> Result<glob::Pattern, TransferError> {
    glob::Pattern::new(name).map_err(|e| TransferError::NotSupported(e.to_string()))
}

fn protocol(e: ssh2::Error) -> TransferError {
    TransferError::Protocol(e.message().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(SftpCommand::parse("").unwrap(), None);
        assert_eq!(SftpCommand::parse("ls").unwrap(), Some(SftpCommand::Ls(None)));
        assert_eq!(
            SftpCommand::parse("get *.log logs").unwrap(),
            Some(SftpCommand::Get("*.log".into(), Some("logs".into())))
        );
        assert_eq!(
            SftpCommand::parse("REN a b").unwrap(),
            Some(SftpCommand::Ren("a".into(), "b".into()))
        );
        assert_eq!(SftpCommand::parse("quit").unwrap(), Some(SftpCommand::Bye));
        assert_eq!(SftpCommand::parse("lpwd").unwrap(), Some(SftpCommand::Lpwd));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(SftpCommand::parse("cd"), Err(TransferError::Usage("cd path"))));
        assert!(matches!(SftpCommand::parse("ren a"), Err(TransferError::Usage(_))));
        let err = SftpCommand::parse("chmod 644 x").unwrap_err();
        assert_eq!(err.to_string(), "unknown command: chmod");
    }

    #[test]
    fn test_remote_paths() {
        assert_eq!(join_remote("/home/ops", "logs"), "/home/ops/logs");
        assert_eq!(join_remote("/", "etc"), "/etc");
        assert_eq!(join_remote("/home/ops", "/tmp"), "/tmp");
        assert_eq!(join_remote("/home/ops", "."), "/home/ops");
        assert_eq!(split_remote("/var/log/*.gz"), ("/var/log", "*.gz"));
        assert_eq!(split_remote("/boot"), ("/", "boot"));
        assert_eq!(split_remote("file"), (".", "file"));
    }

    #[test]
    fn test_mode_string() {
        assert_eq!(mode_string(0o040755), "drwxr-xr-x");
        assert_eq!(mode_string(0o100644), "-rw-r--r--");
        assert_eq!(mode_string(0o120777), "lrwxrwxrwx");
    }

    #[test]
    fn test_copy_counts_bytes() {
        let data = vec![7u8; CHUNK * 2 + 5];
        let mut out = Vec::new();
        let n = copy(&mut data.as_slice(), &mut out).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }
}
