//! Session transports.
//!
//! One closed enum covers every way of reaching a host:
//!
//! - **pipe**: a local command's stdin/stdout
//! - **serial**: a serial port
//! - **tcp**: a telnet connection with option negotiation
//! - **ssh**: an SSH session in shell, SFTP or netconf mode
//!
//! Each transport runs one background reader thread and reports through a
//! [`Frontend`]: `Connected` once, `Data` per chunk, `Disconnected` exactly
//! once with a human-readable reason.
//!
//! # Architecture
//!
//! ```text
//! Transport
//! ├── connect()     spawns the reader thread (no-op when already running)
//! ├── write()       CR while idle reconnects
//! ├── disconnect()  cooperative: closes the socket/child, reader reports
//! └── Frontend      event(Event), ask(prompt, echo)
//! ```

pub mod error;
pub mod pipe;
pub mod serial;
pub mod ssh;
pub mod tcp;
pub mod telnet;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

pub use error::TransportError;
pub use pipe::PipeTransport;
pub use serial::{SerialSettings, SerialTransport};
pub use ssh::{SshMode, SshTransport};
pub use tcp::TcpTransport;

/// What a transport reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Session established; the owner should send the terminal size
    Connected,
    /// Bytes from the host
    Data(Vec<u8>),
    /// Session ended, with the reason
    Disconnected(String),
}

/// The transport's view of whoever owns it
pub trait Frontend: Send + Sync {
    fn event(&self, event: Event);

    /// Ask the user for a line of input. `None` when nobody answered in time.
    fn ask(&self, prompt: &str, echo: bool) -> Option<String>;

    /// Status text written into the session output
    fn print(&self, text: &str) {
        self.event(Event::Data(text.replace('\n', "\r\n").into_bytes()));
    }
}

pub type Sink = Arc<dyn Frontend>;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Authenticating,
    Connected,
}

/// Transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Pipe,
    Serial,
    Tcp,
    Ssh,
    Sftp,
    Netconf,
}

/// Atomic holder for [`State`]
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(State::Idle as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> State {
        match self.0.load(Ordering::Acquire) {
            1 => State::Connecting,
            2 => State::Authenticating,
            3 => State::Connected,
            _ => State::Idle,
        }
    }

    pub fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Idle → Connecting; false if a session is already running
    pub fn begin(&self) -> bool {
        self.0
            .compare_exchange(
                State::Idle as u8,
                State::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Settings shared by every transport
#[derive(Debug, Clone)]
pub struct Settings {
    pub term_type: String,
    pub cols: u16,
    pub rows: u16,
    pub keepalive: u32,
    pub connect_timeout: Duration,
    pub prompt_timeout: Duration,
    pub known_hosts: PathBuf,
    pub identity_files: Vec<PathBuf>,
    pub local_echo: bool,
}

impl Default for Settings {
    fn default() -> Self {
        crate::config::Config::default().settings()
    }
}

/// A parsed connection target
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Pipe {
        command: String,
    },
    Serial {
        port: String,
        settings: SerialSettings,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Ssh {
        mode: SshMode,
        user: Option<String>,
        password: Option<String>,
        host: String,
        port: u16,
    },
}

impl Target {
    /// Parse `[protocol] spec`:
    ///
    /// - `ssh [user[:password]@]host[:port]` (also `sftp`, `netconf`)
    /// - `telnet host[:port]`
    /// - `serial port[:baud[,parity,data,stop]]`
    /// - `pipe command line`
    ///
    /// A bare host is an ssh target.
    pub fn parse(text: &str) -> Result<Target, TransportError> {
        let text = text.trim();
        let (proto, rest) = match text.split_once(char::is_whitespace) {
            Some((p, r)) => (p, r.trim()),
            None => (text, ""),
        };
        let invalid = || TransportError::InvalidTarget(text.to_string());
        match proto.to_ascii_lowercase().as_str() {
            "ssh" => Self::parse_ssh(SshMode::Shell, rest, 22).ok_or_else(invalid),
            "sftp" => Self::parse_ssh(SshMode::Sftp, rest, 22).ok_or_else(invalid),
            "netconf" => Self::parse_ssh(SshMode::Netconf, rest, 830).ok_or_else(invalid),
            "telnet" => {
                let (host, port) = split_host_port(rest, 23).ok_or_else(invalid)?;
                Ok(Target::Tcp { host, port })
            }
            "serial" => {
                let (port, settings) = match rest.split_once(':') {
                    Some((port, spec)) => (port, SerialSettings::parse(spec).ok_or_else(invalid)?),
                    None => (rest, SerialSettings::default()),
                };
                if port.is_empty() {
                    return Err(invalid());
                }
                Ok(Target::Serial {
                    port: port.to_string(),
                    settings,
                })
            }
            "pipe" if !rest.is_empty() => Ok(Target::Pipe {
                command: rest.to_string(),
            }),
            _ if rest.is_empty() => Self::parse_ssh(SshMode::Shell, text, 22).ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }

    fn parse_ssh(mode: SshMode, spec: &str, default_port: u16) -> Option<Target> {
        if spec.is_empty() || spec.contains(char::is_whitespace) {
            return None;
        }
        let (cred, hostport) = match spec.rsplit_once('@') {
            Some((c, h)) => (Some(c), h),
            None => (None, spec),
        };
        let (user, password) = match cred {
            Some(c) => match c.split_once(':') {
                Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
                None => (Some(c.to_string()), None),
            },
            None => (None, None),
        };
        let (host, port) = split_host_port(hostport, default_port)?;
        Some(Target::Ssh {
            mode,
            user: user.filter(|u| !u.is_empty()),
            password: password.filter(|p| !p.is_empty()),
            host,
            port,
        })
    }

    /// Display name, credentials omitted
    pub fn name(&self) -> String {
        match self {
            Target::Pipe { command } => command.clone(),
            Target::Serial { port, .. } => port.clone(),
            Target::Tcp { host, port } => format!("{}:{}", host, port),
            Target::Ssh { host, port, .. } => format!("{}:{}", host, port),
        }
    }
}

/// `host[:port]`, `[v6addr]:port` or a bare IPv6 address
fn split_host_port(spec: &str, default_port: u16) -> Option<(String, u16)> {
    if spec.is_empty() {
        return None;
    }
    if let Some(rest) = spec.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match spec.matches(':').count() {
        0 => Some((spec.to_string(), default_port)),
        1 => {
            let (host, port) = spec.split_once(':')?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((spec.to_string(), default_port)),
    }
}

/// A session transport
pub enum Transport {
    Pipe(PipeTransport),
    Serial(SerialTransport),
    Tcp(TcpTransport),
    Ssh(SshTransport),
}

impl Transport {
    pub fn new(target: Target, settings: Settings, sink: Sink) -> Self {
        match target {
            Target::Pipe { command } => Transport::Pipe(PipeTransport::new(command, settings, sink)),
            Target::Serial { port, settings: s } => {
                Transport::Serial(SerialTransport::new(port, s, settings, sink))
            }
            Target::Tcp { host, port } => Transport::Tcp(TcpTransport::new(host, port, settings, sink)),
            Target::Ssh {
                mode,
                user,
                password,
                host,
                port,
            } => Transport::Ssh(SshTransport::new(mode, host, port, user, password, settings, sink)),
        }
    }

    /// Start the reader thread; no-op while a session is running
    pub fn connect(&self) {
        match self {
            Transport::Pipe(t) => t.connect(),
            Transport::Serial(t) => t.connect(),
            Transport::Tcp(t) => t.connect(),
            Transport::Ssh(t) => t.connect(),
        }
    }

    /// Send bytes to the host. A carriage return while idle reconnects.
    pub fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.state() == State::Idle {
            if data.first() == Some(&b'\r') {
                self.connect();
                return Ok(());
            }
            return Err(TransportError::NotConnected);
        }
        match self {
            Transport::Pipe(t) => t.write(data),
            Transport::Serial(t) => t.write(data),
            Transport::Tcp(t) => t.write(data),
            Transport::Ssh(t) => t.write(data),
        }
    }

    /// Propagate the terminal geometry to the remote pty
    pub fn send_size(&self, cols: u16, rows: u16) {
        if let Transport::Ssh(t) = self {
            t.send_size(cols, rows);
        }
    }

    /// Ask the session to end; the reader thread reports `Disconnected`
    pub fn disconnect(&self) {
        match self {
            Transport::Pipe(t) => t.disconnect(),
            Transport::Serial(t) => t.disconnect(),
            Transport::Tcp(t) => t.disconnect(),
            Transport::Ssh(t) => t.disconnect(),
        }
    }

    /// Handle a telnet command recognised in the host stream
    pub fn telnet(&self, command: &[u8]) {
        if let Transport::Tcp(t) = self {
            t.negotiate(command);
        }
    }

    pub fn state(&self) -> State {
        match self {
            Transport::Pipe(t) => t.state(),
            Transport::Serial(t) => t.state(),
            Transport::Tcp(t) => t.state(),
            Transport::Ssh(t) => t.state(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Transport::Pipe(t) => t.name(),
            Transport::Serial(t) => t.name(),
            Transport::Tcp(t) => t.name(),
            Transport::Ssh(t) => t.name(),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Transport::Pipe(_) => Kind::Pipe,
            Transport::Serial(_) => Kind::Serial,
            Transport::Tcp(_) => Kind::Tcp,
            Transport::Ssh(t) => match t.mode() {
                SshMode::Shell => Kind::Ssh,
                SshMode::Sftp => Kind::Sftp,
                SshMode::Netconf => Kind::Netconf,
            },
        }
    }

    pub fn as_ssh(&self) -> Option<&SshTransport> {
        match self {
            Transport::Ssh(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_serial(&self) -> Option<&SerialTransport> {
        match self {
            Transport::Serial(t) => Some(t),
            _ => None,
        }
    }
}

/// Resolve and connect with a timeout, trying every resolved address
pub(crate) fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<std::net::TcpStream, TransportError> {
    use std::net::ToSocketAddrs;

    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|_| TransportError::Resolve(host.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve(host.to_string()));
    }
    let mut last = None;
    for addr in addrs {
        match std::net::TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("could not disable Nagle on {}: {}", addr, e);
                }
                return Ok(stream);
            }
            Err(e) => last = Some(e),
        }
    }
    let err = last.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound));
    Err(TransportError::connect(host, err))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Frontend that records events and answers prompts from a script
    #[derive(Default)]
    pub struct Recorder {
        pub events: Mutex<Vec<Event>>,
        pub answers: Mutex<Vec<Option<String>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl Recorder {
        pub fn with_answers(answers: &[Option<&str>]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().rev().map(|a| a.map(String::from)).collect()),
                ..Self::default()
            }
        }

        pub fn output(&self) -> String {
            let events = self.events.lock().unwrap();
            let mut out = Vec::new();
            for e in events.iter() {
                if let Event::Data(d) = e {
                    out.extend_from_slice(d);
                }
            }
            String::from_utf8_lossy(&out).into_owned()
        }
    }

    impl Frontend for Recorder {
        fn event(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn ask(&self, prompt: &str, _echo: bool) -> Option<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answers.lock().unwrap().pop().flatten()
        }
    }

    #[test]
    fn test_parse_ssh_targets() {
        assert_eq!(
            Target::parse("ssh admin:secret@10.0.0.1:2222").unwrap(),
            Target::Ssh {
                mode: SshMode::Shell,
                user: Some("admin".into()),
                password: Some("secret".into()),
                host: "10.0.0.1".into(),
                port: 2222,
            }
        );
        assert_eq!(
            Target::parse("router1").unwrap(),
            Target::Ssh {
                mode: SshMode::Shell,
                user: None,
                password: None,
                host: "router1".into(),
                port: 22,
            }
        );
        match Target::parse("netconf ops@core").unwrap() {
            Target::Ssh { mode, port, user, .. } => {
                assert_eq!(mode, SshMode::Netconf);
                assert_eq!(port, 830);
                assert_eq!(user.as_deref(), Some("ops"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_other_targets() {
        assert_eq!(
            Target::parse("telnet switch").unwrap(),
            Target::Tcp {
                host: "switch".into(),
                port: 23
            }
        );
        assert_eq!(
            Target::parse("telnet [::1]:2323").unwrap(),
            Target::Tcp {
                host: "::1".into(),
                port: 2323
            }
        );
        assert_eq!(
            Target::parse("pipe ping -c 3 localhost").unwrap(),
            Target::Pipe {
                command: "ping -c 3 localhost".into()
            }
        );
        match Target::parse("serial /dev/ttyUSB0:115200,e,7,2").unwrap() {
            Target::Serial { port, settings } => {
                assert_eq!(port, "/dev/ttyUSB0");
                assert_eq!(settings.baud, 115200);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Target::parse("ssh").is_err());
        assert!(Target::parse("telnet host:notaport").is_err());
        assert!(Target::parse("frobnicate the host").is_err());
    }

    #[test]
    fn test_connect_tcp_disables_nagle() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect_tcp("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn test_state_cell_begin_once() {
        let cell = StateCell::default();
        assert!(cell.begin());
        assert!(!cell.begin());
        assert_eq!(cell.get(), State::Connecting);
        cell.set(State::Idle);
        assert!(cell.begin());
    }
}
