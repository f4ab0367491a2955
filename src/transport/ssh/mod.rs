//! SSH transport: interactive shell, SFTP sub-session, or netconf subsystem
//!
//! # Connection sequence
//!
//! ```text
//! TCP connect ─▶ handshake ─▶ host key check ─▶ authentication
//!     ─▶ channel (pty + shell | subsystem + hello | sftp shell)
//!     ─▶ non-blocking read loop ─▶ teardown
//! ```

pub mod auth;
pub mod known_hosts;
pub mod link;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ssh2::{HashType, HostKeyType, Session};
use tracing::{debug, info, warn};

use self::auth::{Credentials, SessionBackend};
use self::known_hosts::{fingerprint, host_pattern, HostKeyStatus, KnownHosts};
pub use self::link::SshLink;
use super::error::WouldBlock;
use super::{connect_tcp, Event, Frontend, Settings, Sink, State, StateCell, TransportError};
use crate::transfer::sftp::SftpShell;
use crate::util::lock;

/// Sent right after the netconf subsystem opens
const NETCONF_HELLO: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\">\n\
<capabilities>\n\
<capability>urn:ietf:params:netconf:base:1.0</capability>\n\
</capabilities>\n\
</hello>\n\
]]>]]>\n";

/// Largest slice handed to one channel write
const WRITE_CHUNK: usize = 16 * 1024;

/// What the SSH connection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshMode {
    Shell,
    Sftp,
    Netconf,
}

struct Shared {
    state: StateCell,
    stop: AtomicBool,
    /// Raw socket while connecting, so disconnect can interrupt the handshake
    socket: Mutex<Option<TcpStream>>,
    link: Mutex<Option<Arc<SshLink>>>,
    sink: Sink,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

pub struct SshTransport {
    mode: SshMode,
    host: String,
    port: u16,
    name: String,
    user: Mutex<Option<String>>,
    password: Mutex<Option<String>>,
    settings: Settings,
    shared: Arc<Shared>,
}

impl SshTransport {
    pub fn new(
        mode: SshMode,
        host: String,
        port: u16,
        user: Option<String>,
        password: Option<String>,
        settings: Settings,
        sink: Sink,
    ) -> Self {
        Self {
            mode,
            name: format!("{}:{}", host, port),
            host,
            port,
            user: Mutex::new(user),
            password: Mutex::new(password),
            settings,
            shared: Arc::new(Shared {
                state: StateCell::default(),
                stop: AtomicBool::new(false),
                socket: Mutex::new(None),
                link: Mutex::new(None),
                sink,
            }),
        }
    }

    /// Start the session thread. Supplied credentials are used once; a
    /// reconnect asks again.
    pub fn connect(&self) {
        if !self.shared.state.begin() {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        let creds = Credentials::new(lock(&self.user).take(), lock(&self.password).take());
        let job = Job {
            shared: Arc::clone(&self.shared),
            mode: self.mode,
            host: self.host.clone(),
            port: self.port,
            settings: self.settings.clone(),
        };
        let spawned = thread::Builder::new()
            .name("ssh-reader".into())
            .spawn(move || job.run(creds));
        if let Err(e) = spawned {
            self.shared.state.set(State::Idle);
            self.shared.sink.event(Event::Disconnected(e.to_string()));
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let link = self.link().ok_or(TransportError::NotConnected)?;
        for chunk in data.chunks(WRITE_CHUNK) {
            let mut sent = 0;
            while sent < chunk.len() {
                let n = link.retry(|_, channel| match channel.as_mut() {
                    Some(ch) => ch.write(&chunk[sent..]),
                    None => Err(std::io::ErrorKind::NotConnected.into()),
                });
                match n {
                    Ok(n) => sent += n,
                    Err(e) => {
                        warn!("ssh write failed, closing: {}", e);
                        self.disconnect();
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn send_size(&self, cols: u16, rows: u16) {
        let Some(link) = self.link() else {
            return;
        };
        if self.mode != SshMode::Shell {
            return;
        }
        let result = link.retry(|_, channel| match channel.as_mut() {
            Some(ch) => ch.request_pty_size(cols as u32, rows as u32, None, None),
            None => Ok(()),
        });
        if let Err(e) = result {
            debug!("pty resize failed: {}", e);
        }
    }

    /// Cooperative: the session thread notices and reports `Disconnected`
    pub fn disconnect(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(socket) = lock(&self.shared.socket).as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if let Some(link) = lock(&self.shared.link).as_ref() {
            link.shutdown();
        }
    }

    pub fn state(&self) -> State {
        self.shared.state.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> SshMode {
        self.mode
    }

    fn link(&self) -> Option<Arc<SshLink>> {
        lock(&self.shared.link).clone()
    }

    /// The live connection, for transfers and tunnels. SFTP sessions keep
    /// their session blocking, so they carry no jobs.
    pub fn job_link(&self) -> Option<Arc<SshLink>> {
        match self.mode {
            SshMode::Sftp => None,
            SshMode::Shell | SshMode::Netconf => self.link(),
        }
    }
}

struct Job {
    shared: Arc<Shared>,
    mode: SshMode,
    host: String,
    port: u16,
    settings: Settings,
}

impl Job {
    fn run(self, mut creds: Credentials) {
        let result = self.session(&mut creds);
        creds.clear();
        let reason = match result {
            Ok(()) => "Connection closed".to_string(),
            Err(_) if self.shared.stopped() => "Disconnected".to_string(),
            Err(e) => e.to_string(),
        };
        if let Some(link) = lock(&self.shared.link).take() {
            link.close();
        }
        if let Some(socket) = lock(&self.shared.socket).take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.shared.state.set(State::Idle);
        info!("ssh {}:{} disconnected: {}", self.host, self.port, reason);
        self.shared.sink.event(Event::Disconnected(reason));
    }

    fn session(&self, creds: &mut Credentials) -> Result<(), TransportError> {
        info!("connecting to ssh {}:{}", self.host, self.port);
        let stream = connect_tcp(&self.host, self.port, self.settings.connect_timeout)?;
        *lock(&self.shared.socket) = Some(stream.try_clone()?);

        let mut session = Session::new()?;
        session.set_tcp_stream(stream.try_clone()?);
        session.set_timeout(self.settings.connect_timeout.as_millis() as u32);
        session.handshake()?;
        debug!("ssh handshake with {} done", self.host);

        verify_host_key(&session, &self.host, self.port, &self.settings, &*self.shared.sink)?;

        self.shared.state.set(State::Authenticating);
        let mut backend = SessionBackend::new(&session);
        auth::authenticate(
            &mut backend,
            creds,
            &self.host,
            &self.settings.identity_files,
            &*self.shared.sink,
        )?;

        let link = Arc::new(SshLink::new(session, stream));
        *lock(&self.shared.link) = Some(Arc::clone(&link));
        if self.shared.stopped() {
            return Err(TransportError::NotConnected);
        }

        match self.mode {
            SshMode::Sftp => self.sftp(&link),
            SshMode::Shell | SshMode::Netconf => {
                self.open_channel(&link)?;
                self.read_loop(&link)
            }
        }
    }

    /// Open the main channel in blocking mode, then switch the session to
    /// non-blocking for the read loop
    fn open_channel(&self, link: &SshLink) -> Result<(), TransportError> {
        link.with(|session, main| -> Result<(), TransportError> {
            let mut channel = session
                .channel_session()
                .map_err(|e| TransportError::Channel(e.to_string()))?;
            match self.mode {
                SshMode::Netconf => {
                    channel
                        .subsystem("netconf")
                        .map_err(|_| TransportError::Subsystem("netconf".into()))?;
                    channel.write_all(NETCONF_HELLO.as_bytes())?;
                }
                _ => {
                    let size = (self.settings.cols as u32, self.settings.rows as u32, 0, 0);
                    channel
                        .request_pty(&self.settings.term_type, None, Some(size))
                        .map_err(|e| TransportError::Channel(e.to_string()))?;
                    channel
                        .shell()
                        .map_err(|e| TransportError::Channel(e.to_string()))?;
                }
            }
            *main = Some(channel);
            session.set_timeout(0);
            if self.settings.keepalive > 0 {
                session.set_keepalive(true, self.settings.keepalive);
            }
            session.set_blocking(false);
            Ok(())
        })?;
        self.shared.state.set(State::Connected);
        info!("ssh {}:{} connected ({:?})", self.host, self.port, self.mode);
        self.shared.sink.event(Event::Connected);
        Ok(())
    }

    fn read_loop(&self, link: &SshLink) -> Result<(), TransportError> {
        let mut buf = vec![0u8; 16 * 1024];
        let keepalive = self.settings.keepalive;
        let mut next_keepalive = Instant::now() + Duration::from_secs(keepalive as u64);
        loop {
            if self.shared.stopped() {
                return Ok(());
            }
            let step = link.with(|_, main| {
                let Some(ch) = main.as_mut() else {
                    return Step::Eof;
                };
                match ch.read(&mut buf) {
                    Ok(0) if ch.eof() => Step::Eof,
                    Ok(0) => Step::Idle,
                    Ok(n) => Step::Data(n),
                    Err(e) if e.would_block() => {
                        if ch.eof() {
                            Step::Eof
                        } else {
                            Step::Idle
                        }
                    }
                    Err(e) => Step::Failed(e),
                }
            });
            match step {
                Step::Data(n) => self.shared.sink.event(Event::Data(buf[..n].to_vec())),
                Step::Idle => link.wait(),
                Step::Eof => return Ok(()),
                Step::Failed(e) => return Err(e.into()),
            }
            if keepalive > 0 && Instant::now() >= next_keepalive {
                let wait = link.with(|session, _| session.keepalive_send()).unwrap_or(keepalive);
                next_keepalive = Instant::now() + Duration::from_secs(wait.max(1) as u64);
            }
        }
    }

    /// Interactive SFTP: commands arrive through the frontend prompt
    fn sftp(&self, link: &SshLink) -> Result<(), TransportError> {
        let sftp = link.with(|session, _| session.sftp())?;
        self.shared.state.set(State::Connected);
        info!("sftp {}:{} connected", self.host, self.port);
        self.shared.sink.event(Event::Connected);

        let frontend: &dyn Frontend = &*self.shared.sink;
        let mut shell = SftpShell::new(sftp, frontend);
        frontend.print(&format!("Connected to {}. Type help for commands.\n", self.host));
        while !self.shared.stopped() {
            let Some(line) = frontend.ask("sftp> ", true) else {
                break;
            };
            let keep_going = link.with(|_, _| shell.execute(&line));
            if !keep_going {
                break;
            }
        }
        Ok(())
    }
}

enum Step {
    Data(usize),
    Idle,
    Eof,
    Failed(std::io::Error),
}

/// OpenSSH name of a host key type
fn key_type_name(kind: HostKeyType) -> &'static str {
    match kind {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

fn verify_host_key(
    session: &Session,
    host: &str,
    port: u16,
    settings: &Settings,
    frontend: &dyn Frontend,
) -> Result<(), TransportError> {
    let (key, kind) = session.host_key().ok_or(TransportError::HostKeyRejected)?;
    let key_type = key_type_name(kind);
    let fp = fingerprint(session.host_key_hash(HashType::Sha256).unwrap_or_default());
    let mut store = KnownHosts::load(&settings.known_hosts);
    let status = store.check(host, port, key_type, key);
    match decide(status, host, port, key_type, &fp, frontend)? {
        Decision::Trusted => Ok(()),
        Decision::Save => {
            if let Err(e) = store.add(host, port, key_type, key) {
                warn!("could not update {}: {}", settings.known_hosts.display(), e);
            }
            Ok(())
        }
    }
}

#[derive(Debug, PartialEq)]
enum Decision {
    Trusted,
    Save,
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Resolve a known-hosts lookup, asking the user when needed. No answer
/// means abort.
fn decide(
    status: HostKeyStatus,
    host: &str,
    port: u16,
    key_type: &str,
    fp: &str,
    frontend: &dyn Frontend,
) -> Result<Decision, TransportError> {
    let name = host_pattern(host, port);
    match status {
        HostKeyStatus::Match => {
            debug!("host key for {} matches", name);
            Ok(Decision::Trusted)
        }
        HostKeyStatus::Revoked => {
            frontend.print(&format!(
                "The {} host key for {} is marked as revoked.\nFingerprint is {}\n",
                key_type, name, fp
            ));
            warn!("refusing revoked host key for {}", name);
            Err(TransportError::HostKeyRejected)
        }
        HostKeyStatus::Mismatch => {
            frontend.print(&format!(
                "WARNING: the {} host key for {} has changed!\nNew fingerprint is {}\n",
                key_type, name, fp
            ));
            match frontend.ask("Continue connecting? (yes/no) ", true) {
                Some(answer) if is_yes(&answer) => {
                    warn!("accepted changed host key for {}", name);
                    Ok(Decision::Trusted)
                }
                _ => {
                    info!("rejected changed host key for {}", name);
                    Err(TransportError::HostKeyChanged(name))
                }
            }
        }
        HostKeyStatus::NotFound => {
            frontend.print(&format!(
                "The authenticity of host '{}' can't be established.\n{} key fingerprint is {}.\n",
                name, key_type, fp
            ));
            match frontend.ask("Add this key to known hosts? (yes/no) ", true) {
                Some(answer) if is_yes(&answer) => {
                    info!("saving host key for {}", name);
                    Ok(Decision::Save)
                }
                Some(_) => {
                    info!("continuing without saving host key for {}", name);
                    Ok(Decision::Trusted)
                }
                None => Err(TransportError::HostKeyRejected),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::Recorder;

    #[test]
    fn test_changed_key_defaults_to_abort() {
        let ui = Recorder::with_answers(&[None]);
        let err = decide(HostKeyStatus::Mismatch, "core", 22, "ssh-ed25519", "SHA256:x", &ui).unwrap_err();
        assert!(matches!(err, TransportError::HostKeyChanged(ref h) if h == "core"));
        assert!(ui.output().contains("has changed"));

        let ui = Recorder::with_answers(&[Some("yes")]);
        let ok = decide(HostKeyStatus::Mismatch, "core", 22, "ssh-ed25519", "SHA256:x", &ui).unwrap();
        assert_eq!(ok, Decision::Trusted);
    }

    #[test]
    fn test_unknown_key_choices() {
        let ui = Recorder::with_answers(&[Some("y")]);
        assert_eq!(
            decide(HostKeyStatus::NotFound, "edge", 2222, "ssh-rsa", "SHA256:x", &ui).unwrap(),
            Decision::Save
        );
        assert!(ui.output().contains("[edge]:2222"));

        let ui = Recorder::with_answers(&[Some("no")]);
        assert_eq!(
            decide(HostKeyStatus::NotFound, "edge", 22, "ssh-rsa", "SHA256:x", &ui).unwrap(),
            Decision::Trusted
        );

        let ui = Recorder::with_answers(&[None]);
        assert!(matches!(
            decide(HostKeyStatus::NotFound, "edge", 22, "ssh-rsa", "SHA256:x", &ui),
            Err(TransportError::HostKeyRejected)
        ));
    }

    #[test]
    fn test_revoked_key_aborts_without_asking() {
        let ui = Recorder::with_answers(&[Some("yes")]);
        assert!(matches!(
            decide(HostKeyStatus::Revoked, "core", 22, "ssh-ed25519", "SHA256:x", &ui),
            Err(TransportError::HostKeyRejected)
        ));
        assert!(ui.output().contains("revoked"));
        assert!(ui.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_matching_key_asks_nothing() {
        let ui = Recorder::default();
        assert_eq!(
            decide(HostKeyStatus::Match, "core", 22, "ssh-ed25519", "SHA256:x", &ui).unwrap(),
            Decision::Trusted
        );
        assert!(ui.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_refused_connection_reports_reason() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let rec = Arc::new(Recorder::default());
        let ssh = SshTransport::new(
            SshMode::Shell,
            "127.0.0.1".into(),
            port,
            Some("admin".into()),
            Some("secret".into()),
            Settings::default(),
            rec.clone(),
        );
        ssh.connect();
        let deadline = Instant::now() + Duration::from_secs(5);
        while rec.events.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ssh.state(), State::Idle);
        assert!(lock(&ssh.password).is_none());
        let events = rec.events.lock().unwrap().clone();
        assert!(matches!(&events[0], Event::Disconnected(_)));
    }

    #[test]
    fn test_sftp_session_carries_no_jobs() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        for (mode, carries) in [(SshMode::Shell, true), (SshMode::Netconf, true), (SshMode::Sftp, false)] {
            let ssh = SshTransport::new(
                mode,
                "127.0.0.1".into(),
                addr.port(),
                None,
                None,
                Settings::default(),
                Arc::new(Recorder::default()),
            );
            assert!(ssh.job_link().is_none());
            let socket = TcpStream::connect(addr).unwrap();
            let link = SshLink::new(Session::new().unwrap(), socket);
            *lock(&ssh.shared.link) = Some(Arc::new(link));
            assert_eq!(ssh.job_link().is_some(), carries, "{:?}", mode);
        }
    }

    #[test]
    fn test_key_type_names() {
        assert_eq!(key_type_name(HostKeyType::Ed25519), "ssh-ed25519");
        assert_eq!(key_type_name(HostKeyType::Ecdsa256), "ecdsa-sha2-nistp256");
    }
}
