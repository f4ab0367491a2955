//! Session engine
//!
//! One [`Engine`] owns one terminal and at most one live transport. The
//! transport's reader thread calls back through [`EngineLink`]; every buffer
//! mutation happens under the terminal lock and is announced on a condition
//! variable (for `#Waitfor` and friends) and as an [`EngineEvent`] for the
//! consumer.
//!
//! While a transport is asking the user something (login, passphrase, host
//! key decision, sftp command), keystrokes passed to [`Engine::write`] are
//! captured into a line instead of being sent to the host.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::script::{Command, ScriptError, TunCommand, XmodemDirection};
use super::term::{Direction, Response, Terminal};
use crate::transfer::{scp, tunnel, xmodem, TransferError};
use crate::transport::{Event, Frontend, Kind, Settings, Sink, State, Target, Transport, TransportError};
use crate::util::{deadline, expired, lock, wait_until};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("Timed out waiting for \"{0}\"")]
    Timeout(String),

    #[error("Session log: {0}")]
    Log(#[from] io::Error),

    #[error("{0} is only available on {1} sessions")]
    WrongSession(&'static str, &'static str),
}

/// What the consumer hears about
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The buffer changed
    Redraw,
    Title(String),
    Connected(String),
    Disconnected(String),
    Bell,
}

/// A line being typed in answer to a transport prompt
#[derive(Default)]
struct Capture {
    active: bool,
    echo: bool,
    line: String,
    /// Set when the line is finished; `Some(None)` means cancelled
    result: Option<Option<String>>,
}

struct ScriptState {
    prompt: String,
    timeout: Duration,
}

pub struct Engine {
    me: Weak<Engine>,
    /// Bumped per connect; links from older sessions are ignored
    generation: AtomicU64,
    terminal: Mutex<Terminal>,
    changed: Condvar,
    transport: Mutex<Option<Arc<Transport>>>,
    settings: Settings,
    events: Sender<EngineEvent>,
    capture: Mutex<Capture>,
    captured: Condvar,
    script: Mutex<ScriptState>,
    log: Mutex<Option<File>>,
}

impl Engine {
    /// `wait_timeout` is the default for `#Waitfor` and `#Send`
    pub fn new(settings: Settings, wait_timeout: Duration) -> (Arc<Engine>, Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::new_cyclic(|me| Engine {
            me: me.clone(),
            generation: AtomicU64::new(0),
            terminal: Mutex::new(Terminal::new(settings.cols, settings.rows)),
            changed: Condvar::new(),
            transport: Mutex::new(None),
            settings,
            events: tx,
            capture: Mutex::new(Capture::default()),
            captured: Condvar::new(),
            script: Mutex::new(ScriptState {
                prompt: String::new(),
                timeout: wait_timeout,
            }),
            log: Mutex::new(None),
        });
        (engine, rx)
    }

    /// Frontend handle for transports and jobs; holds the engine weakly
    pub fn frontend(&self) -> Sink {
        Arc::new(EngineLink {
            engine: self.me.clone(),
            generation: self.generation.load(Ordering::Acquire),
        })
    }

    /// Start a new session generation and hand out its frontend
    fn next_frontend(&self) -> Sink {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.frontend()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Run `f` against the terminal under its lock
    pub fn with_terminal<R>(&self, f: impl FnOnce(&mut Terminal) -> R) -> R {
        let mut term = lock(&self.terminal);
        f(&mut term)
    }

    fn current(&self) -> Option<Arc<Transport>> {
        lock(&self.transport).clone()
    }

    pub fn state(&self) -> State {
        self.current().map_or(State::Idle, |t| t.state())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Replace the current session with one to `target`
    pub fn connect(&self, target: &str) -> Result<(), EngineError> {
        let target = Target::parse(target)?;
        self.disconnect();

        let mut settings = self.settings.clone();
        let kind = {
            let mut term = lock(&self.terminal);
            settings.cols = term.buffer.cols() as u16;
            settings.rows = term.buffer.rows() as u16;
            let transport = Transport::new(target, settings, self.next_frontend());
            let kind = transport.kind();
            term.set_telnet(kind == Kind::Tcp);
            term.buffer.modes.newline = kind == Kind::Pipe;
            *lock(&self.transport) = Some(Arc::new(transport));
            kind
        };
        if let Some(t) = self.current() {
            info!("connecting {:?} {}", kind, t.name());
            t.connect();
        }
        Ok(())
    }

    /// Ask the current session to end; `Disconnected` follows from the reader
    pub fn disconnect(&self) {
        self.cancel_capture();
        if let Some(t) = self.current() {
            t.disconnect();
        }
    }

    /// Keystrokes from the user
    pub fn write(&self, data: &[u8]) {
        if self.capture_input(data) {
            return;
        }
        let Some(t) = self.current() else {
            return;
        };
        if let Err(e) = t.write(data) {
            debug!("write dropped: {}", e);
        }
    }

    /// Bytes for the host, never captured
    fn send_raw(&self, data: &[u8]) -> Result<(), TransportError> {
        match self.current() {
            Some(t) => t.write(data),
            None => Err(TransportError::NotConnected),
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        lock(&self.terminal).resize(cols, rows);
        if let Some(t) = self.current() {
            t.send_size(cols, rows);
        }
        self.emit(EngineEvent::Redraw);
    }

    pub fn clear(&self) {
        lock(&self.terminal).clear();
        self.changed.notify_all();
        self.emit(EngineEvent::Redraw);
    }

    pub fn search(&self, text: &str, direction: Direction) -> bool {
        let found = lock(&self.terminal).buffer.search(text.as_bytes(), direction);
        self.emit(EngineEvent::Redraw);
        found
    }

    /// Scroll the view through history; positive is towards the bottom
    pub fn scroll(&self, delta: isize) {
        lock(&self.terminal).buffer.scroll_view(delta);
        self.emit(EngineEvent::Redraw);
    }

    /// Status text into the session output
    pub fn print(&self, text: &str) {
        self.receive(text.replace('\n', "\r\n").as_bytes(), false);
    }

    /// Run one command line. Blocking commands (`#Wait`, `#Waitfor`, `#Send`)
    /// block the caller; transfer jobs run on their own threads.
    pub fn command(&self, text: &str) -> Result<(), EngineError> {
        let command = Command::parse(text)?;
        debug!("command {:?}", command);
        match command {
            Command::Wait(d) => thread::sleep(d),
            Command::Timeout(d) => lock(&self.script).timeout = d,
            Command::Prompt(p) => lock(&self.script).prompt = p,
            Command::Send(text) => {
                lock(&self.terminal).buffer.set_recv_mark();
                self.send_raw(format!("{}\r", text).as_bytes())?;
                let (prompt, timeout) = {
                    let s = lock(&self.script);
                    (s.prompt.clone(), s.timeout)
                };
                if !prompt.is_empty() {
                    self.wait_for(&prompt, timeout)?;
                }
            }
            Command::Waitfor(text) => {
                let timeout = lock(&self.script).timeout;
                self.wait_for(&text, timeout)?;
            }
            Command::Log(path) => self.set_log(path.as_deref())?,
            Command::Clear => self.clear(),
            Command::Scp(job) => {
                let link = self.ssh_link("scp")?;
                let out = self.frontend();
                spawn_job("scp", move || {
                    if let Err(e) = scp::run(&link, &job, &*out) {
                        out.print(&format!("scp: {}\n", e));
                    }
                });
            }
            Command::Tun(cmd) => self.tun(cmd)?,
            Command::Xmodem(direction, path) => self.xmodem(direction, &path)?,
            Command::Line(line) => {
                if self.state() == State::Idle {
                    if !line.trim().is_empty() {
                        self.connect(&line)?;
                    }
                } else {
                    self.send_raw(format!("{}\r", line).as_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Block until `text` shows up after the receive mark
    pub fn wait_for(&self, text: &str, timeout: Duration) -> Result<(), EngineError> {
        let needle = text.as_bytes();
        let deadline = deadline(timeout);
        let mut term = lock(&self.terminal);
        loop {
            if contains(term.buffer.received_text(), needle) {
                return Ok(());
            }
            if expired(deadline) {
                return Err(EngineError::Timeout(text.to_string()));
            }
            term = wait_until(&self.changed, term, deadline);
        }
    }

    fn set_log(&self, path: Option<&Path>) -> Result<(), EngineError> {
        let mut log = lock(&self.log);
        match path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                info!("session log started: {}", path.display());
                *log = Some(file);
            }
            None => {
                if log.take().is_some() {
                    info!("session log stopped");
                }
            }
        }
        Ok(())
    }

    fn ssh_link(&self, what: &'static str) -> Result<Arc<crate::transport::ssh::SshLink>, EngineError> {
        self.current()
            .and_then(|t| t.as_ssh().and_then(|s| s.job_link()))
            .ok_or(EngineError::WrongSession(what, "ssh"))
    }

    fn tun(&self, cmd: TunCommand) -> Result<(), EngineError> {
        let link = self.ssh_link("tun")?;
        match cmd {
            TunCommand::List => {
                let list = link.tunnels().list();
                if list.is_empty() {
                    self.print("no tunnels\n");
                } else {
                    self.print(&format!("{}\n", list.join("\n")));
                }
            }
            TunCommand::Close(port) => {
                let msg = if link.tunnels().close(port) {
                    format!("tunnel {} closed\n", port)
                } else {
                    format!("no tunnel on {}\n", port)
                };
                self.print(&msg);
            }
            TunCommand::Open(spec) => {
                let shown = spec.to_string();
                let port = tunnel::open(&link, spec)?;
                self.print(&format!("tunnel {} on port {}\n", shown, port));
            }
        }
        Ok(())
    }

    fn xmodem(&self, direction: XmodemDirection, path: &Path) -> Result<(), EngineError> {
        let transport = self.current().ok_or(TransportError::NotConnected)?;
        let serial = transport
            .as_serial()
            .ok_or(EngineError::WrongSession("xmodem", "serial"))?;
        let mut port = serial.divert()?;
        let out = self.frontend();
        let path = path.to_path_buf();
        match direction {
            XmodemDirection::Send => {
                let data = std::fs::read(&path).map_err(|source| TransferError::LocalOpen {
                    path: path.clone(),
                    source,
                })?;
                spawn_job("xmodem-send", move || {
                    let started = Instant::now();
                    match xmodem::send(&mut port, &data, xmodem::Timing::default()) {
                        Ok(stats) => out.print(&format!(
                            "xmodem: sent {} bytes in {:.1}s ({} retries)\n",
                            stats.bytes,
                            started.elapsed().as_secs_f64(),
                            stats.retries
                        )),
                        Err(e) => out.print(&format!("xmodem: {}\n", e)),
                    }
                });
            }
            XmodemDirection::Receive => {
                let mut file = File::create(&path).map_err(|source| TransferError::LocalOpen {
                    path: path.clone(),
                    source,
                })?;
                spawn_job("xmodem-recv", move || {
                    let started = Instant::now();
                    match xmodem::receive(&mut port, &mut file, xmodem::Timing::default()) {
                        Ok(stats) => out.print(&format!(
                            "xmodem: received {} bytes in {:.1}s\n",
                            stats.bytes,
                            started.elapsed().as_secs_f64()
                        )),
                        Err(e) => out.print(&format!("xmodem: {}\n", e)),
                    }
                });
            }
        }
        Ok(())
    }

    // ---- transport callbacks --------------------------------------------

    fn on_event(&self, event: Event) {
        match event {
            Event::Connected => {
                let (cols, rows) = {
                    let term = lock(&self.terminal);
                    (term.buffer.cols() as u16, term.buffer.rows() as u16)
                };
                let name = match self.current() {
                    Some(t) => {
                        t.send_size(cols, rows);
                        t.name().to_string()
                    }
                    None => String::new(),
                };
                self.emit(EngineEvent::Connected(name));
            }
            Event::Data(data) => self.receive(&data, true),
            Event::Disconnected(reason) => {
                self.cancel_capture();
                self.print(&format!("\n{}\n", reason));
                self.emit(EngineEvent::Disconnected(reason));
            }
        }
    }

    /// Feed bytes through the interpreter and react to what it reports
    fn receive(&self, data: &[u8], from_host: bool) {
        if from_host {
            if let Some(file) = lock(&self.log).as_mut() {
                if let Err(e) = file.write_all(data) {
                    warn!("session log write failed: {}", e);
                }
            }
        }
        let responses = lock(&self.terminal).feed(data);
        self.changed.notify_all();
        for response in responses {
            if let Some(reply) = response.reply() {
                if let Err(e) = self.send_raw(&reply) {
                    debug!("terminal reply not sent: {}", e);
                }
                continue;
            }
            match response {
                Response::Telnet(cmd) => {
                    if let Some(t) = self.current() {
                        t.telnet(&cmd);
                    }
                }
                Response::Title(title) => self.emit(EngineEvent::Title(title)),
                Response::Bell => self.emit(EngineEvent::Bell),
                _ => {}
            }
        }
        self.emit(EngineEvent::Redraw);
    }

    fn ask(&self, prompt: &str, echo: bool) -> Option<String> {
        {
            let mut cap = lock(&self.capture);
            *cap = Capture {
                active: true,
                echo,
                ..Capture::default()
            };
        }
        self.print(prompt);

        let deadline = deadline(self.settings.prompt_timeout);
        let mut cap = lock(&self.capture);
        let answer = loop {
            if let Some(result) = cap.result.take() {
                break result;
            }
            if expired(deadline) || !cap.active {
                break None;
            }
            cap = wait_until(&self.captured, cap, deadline);
        };
        *cap = Capture::default();
        answer
    }

    /// Route keystrokes into an active capture; false when none is active
    fn capture_input(&self, data: &[u8]) -> bool {
        let mut echo = Vec::new();
        {
            let mut cap = lock(&self.capture);
            if !cap.active || cap.result.is_some() {
                return false;
            }
            for ch in String::from_utf8_lossy(data).chars() {
                match ch {
                    '\r' | '\n' => {
                        let line = std::mem::take(&mut cap.line);
                        cap.result = Some(Some(line));
                        echo.extend_from_slice(b"\r\n");
                        break;
                    }
                    '\u{8}' | '\u{7f}' => {
                        if cap.line.pop().is_some() && cap.echo {
                            echo.extend_from_slice(b"\x08 \x08");
                        }
                    }
                    '\u{3}' => {
                        cap.line.clear();
                        cap.result = Some(None);
                        echo.extend_from_slice(b"^C\r\n");
                        break;
                    }
                    c if c.is_control() => {}
                    c => {
                        cap.line.push(c);
                        if cap.echo {
                            let mut tmp = [0u8; 4];
                            echo.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
                        }
                    }
                }
            }
        }
        self.captured.notify_all();
        if !echo.is_empty() {
            self.receive(&echo, false);
        }
        true
    }

    fn cancel_capture(&self) {
        let mut cap = lock(&self.capture);
        if cap.active && cap.result.is_none() {
            cap.result = Some(None);
        }
        drop(cap);
        self.captured.notify_all();
    }
}

fn contains(hay: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || hay.windows(needle.len()).any(|w| w == needle)
}

fn spawn_job(name: &str, job: impl FnOnce() + Send + 'static) {
    if let Err(e) = thread::Builder::new().name(name.to_string()).spawn(job) {
        warn!("cannot start {}: {}", name, e);
    }
}

/// The engine as seen by a transport. Holds the engine weakly so a dropped
/// engine ends its session. Events and prompts from a replaced session are
/// dropped; its jobs may still print.
pub struct EngineLink {
    engine: Weak<Engine>,
    generation: u64,
}

impl EngineLink {
    fn current(&self) -> Option<Arc<Engine>> {
        let engine = self.engine.upgrade()?;
        if engine.is_current(self.generation) {
            Some(engine)
        } else {
            debug!("dropping callback from replaced session {}", self.generation);
            None
        }
    }
}

impl Frontend for EngineLink {
    fn event(&self, event: Event) {
        if let Some(engine) = self.current() {
            engine.on_event(event);
        }
    }

    fn ask(&self, prompt: &str, echo: bool) -> Option<String> {
        self.current()?.ask(prompt, echo)
    }

    fn print(&self, text: &str) {
        if let Some(engine) = self.engine.upgrade() {
            engine.print(text);
        }
    }
}
