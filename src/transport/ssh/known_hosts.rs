//! OpenSSH known-hosts store
//!
//! Plain and hashed (`|1|salt|hash`) host fields are understood, as are
//! `@revoked` markers. `@cert-authority` lines are ignored.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Outcome of a host-key lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    Match,
    Mismatch,
    NotFound,
    /// The offered key is listed under `@revoked`
    Revoked,
}

#[derive(Debug, Clone)]
enum Hosts {
    Plain(Vec<String>),
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl Hosts {
    fn matches(&self, name: &str) -> bool {
        match self {
            Hosts::Plain(patterns) => patterns.iter().any(|p| pattern_matches(p, name)),
            Hosts::Hashed { salt, hash } => {
                let Ok(mut mac) = HmacSha1::new_from_slice(salt) else {
                    return false;
                };
                mac.update(name.as_bytes());
                mac.verify_slice(hash).is_ok()
            }
        }
    }
}

/// Exact names, plus `*`/`?` wildcards outside `[host]:port` forms
fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == name {
        return true;
    }
    if pattern.starts_with('[') || !pattern.contains(['*', '?']) {
        return false;
    }
    glob::Pattern::new(pattern).map_or(false, |p| p.matches(name))
}

#[derive(Debug, Clone)]
struct Entry {
    hosts: Hosts,
    key_type: String,
    key: Vec<u8>,
    revoked: bool,
}

/// Parsed known-hosts file
#[derive(Debug, Default)]
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<Entry>,
}

/// Host name as written in known_hosts: `host` on 22, `[host]:port` elsewhere
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// `SHA256:` fingerprint of a raw SHA-256 digest, as OpenSSH prints it
pub fn fingerprint(sha256: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(sha256))
}

impl KnownHosts {
    /// Load a store; a missing or unreadable file is an empty store.
    /// Comments and lines that don't parse are skipped.
    pub fn load(path: &Path) -> Self {
        let content = fs::read_to_string(path).unwrap_or_default();
        let entries = content.lines().filter_map(parse_line).collect();
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn check(&self, host: &str, port: u16, key_type: &str, key: &[u8]) -> HostKeyStatus {
        let name = host_pattern(host, port);
        let revoked = self
            .entries
            .iter()
            .any(|e| e.revoked && e.key_type == key_type && e.key == key && e.hosts.matches(&name));
        if revoked {
            return HostKeyStatus::Revoked;
        }
        let mut status = HostKeyStatus::NotFound;
        for entry in self.entries.iter().filter(|e| !e.revoked) {
            if entry.key_type != key_type || !entry.hosts.matches(&name) {
                continue;
            }
            if entry.key == key {
                return HostKeyStatus::Match;
            }
            status = HostKeyStatus::Mismatch;
        }
        status
    }

    /// Append an entry to the file and to this store
    pub fn add(&mut self, host: &str, port: u16, key_type: &str, key: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let name = host_pattern(host, port);
        let needs_newline = fs::read(&self.path)
            .map(|c| !c.is_empty() && !c.ends_with(b"\n"))
            .unwrap_or(false);
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{} {} {}", name, key_type, STANDARD.encode(key))?;
        self.entries.push(Entry {
            hosts: Hosts::Plain(vec![name]),
            key_type: key_type.to_string(),
            key: key.to_vec(),
            revoked: false,
        });
        Ok(())
    }
}

fn parse_hosts(field: &str) -> Option<Hosts> {
    match field.strip_prefix("|1|") {
        Some(hashed) => {
            let (salt, hash) = hashed.split_once('|')?;
            Some(Hosts::Hashed {
                salt: STANDARD.decode(salt).ok()?,
                hash: STANDARD.decode(hash).ok()?,
            })
        }
        None => Some(Hosts::Plain(field.split(',').map(str::to_string).collect())),
    }
}

fn parse_line(line: &str) -> Option<Entry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace().peekable();
    let revoked = match fields.peek() {
        Some(&"@revoked") => {
            fields.next();
            true
        }
        Some(marker) if marker.starts_with('@') => return None,
        _ => false,
    };
    let hosts = parse_hosts(fields.next()?)?;
    let key_type = fields.next()?;
    let key = STANDARD.decode(fields.next()?).ok()?;
    Some(Entry {
        hosts,
        key_type: key_type.to_string(),
        key,
        revoked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00\x20abcdefghijklmnopqrstuvwxyz012345";

    /// Salt bytes 0..20, hashing "router" and "[edge]:2222"
    const HASHED_ROUTER: &str = "|1|AAECAwQFBgcICQoLDA0ODxAREhM=|K72JZTw9Be404QUxZnt7+8kofSk=";
    const HASHED_EDGE: &str = "|1|AAECAwQFBgcICQoLDA0ODxAREhM=|tr1O45X42h/jkXJ2DGpKtIBOO5A=";

    #[test]
    fn test_add_then_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        let mut store = KnownHosts::load(&path);
        assert!(store.is_empty());
        assert_eq!(store.check("router", 22, "ssh-ed25519", KEY), HostKeyStatus::NotFound);

        store.add("router", 22, "ssh-ed25519", KEY).unwrap();
        store.add("router", 2222, "ssh-ed25519", KEY).unwrap();

        let reloaded = KnownHosts::load(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.check("router", 22, "ssh-ed25519", KEY), HostKeyStatus::Match);
        assert_eq!(reloaded.check("router", 2222, "ssh-ed25519", KEY), HostKeyStatus::Match);
        assert_eq!(reloaded.check("router", 23, "ssh-ed25519", KEY), HostKeyStatus::NotFound);
        assert!(fs::read_to_string(&path).unwrap().contains("[router]:2222 ssh-ed25519 "));
    }

    #[test]
    fn test_changed_key_is_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            format!("switch,10.0.0.2 ssh-ed25519 {}\n", STANDARD.encode(KEY)),
        )
        .unwrap();
        let store = KnownHosts::load(&path);
        assert_eq!(store.check("10.0.0.2", 22, "ssh-ed25519", b"other"), HostKeyStatus::Mismatch);
        assert_eq!(store.check("switch", 22, "ssh-rsa", b"other"), HostKeyStatus::NotFound);
    }

    #[test]
    fn test_hashed_entries_match_and_detect_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = STANDARD.encode(KEY);
        fs::write(
            &path,
            format!("{HASHED_ROUTER} ssh-ed25519 {key}\n{HASHED_EDGE} ssh-ed25519 {key}\n"),
        )
        .unwrap();
        let store = KnownHosts::load(&path);
        assert_eq!(store.len(), 2);
        assert_eq!(store.check("router", 22, "ssh-ed25519", KEY), HostKeyStatus::Match);
        assert_eq!(store.check("router", 22, "ssh-ed25519", b"forged"), HostKeyStatus::Mismatch);
        assert_eq!(store.check("edge", 2222, "ssh-ed25519", KEY), HostKeyStatus::Match);
        assert_eq!(store.check("edge", 22, "ssh-ed25519", KEY), HostKeyStatus::NotFound);
        assert_eq!(store.check("routers", 22, "ssh-ed25519", KEY), HostKeyStatus::NotFound);
    }

    #[test]
    fn test_revoked_key_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = STANDARD.encode(KEY);
        fs::write(
            &path,
            format!("@revoked * ssh-ed25519 {key}\nrouter ssh-ed25519 {key}\n"),
        )
        .unwrap();
        let store = KnownHosts::load(&path);
        assert_eq!(store.check("router", 22, "ssh-ed25519", KEY), HostKeyStatus::Revoked);
        assert_eq!(store.check("other", 2222, "ssh-ed25519", KEY), HostKeyStatus::Revoked);
        assert_eq!(store.check("router", 22, "ssh-ed25519", b"fresh"), HostKeyStatus::Mismatch);
    }

    #[test]
    fn test_tolerates_junk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            "# comment\n\n|1|salt ssh-rsa AAAA\n@cert-authority *.lan ssh-rsa AAAA\nbroken\nhost ssh-rsa !!!\n",
        )
        .unwrap();
        assert!(KnownHosts::load(&path).is_empty());
    }

    #[test]
    fn test_wildcard_hosts() {
        assert!(pattern_matches("*.lan", "core.lan"));
        assert!(!pattern_matches("*.lan", "core.wan"));
        assert!(pattern_matches("[edge]:2222", "[edge]:2222"));
        assert!(!pattern_matches("[edge]:2222", "e"));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(&[0u8; 32]);
        assert_eq!(fp, "SHA256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
    }
}
