//! Telnet over TCP

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use super::pipe::echo_bytes;
use super::telnet::{escape_iac, EchoMode, Negotiator};
use super::{connect_tcp, Event, Settings, Sink, State, StateCell, TransportError};
use crate::util::lock;

struct Shared {
    state: StateCell,
    stream: Mutex<Option<TcpStream>>,
    negotiator: Mutex<Negotiator>,
    sink: Sink,
}

/// A telnet session
pub struct TcpTransport {
    host: String,
    port: u16,
    name: String,
    settings: Settings,
    shared: Arc<Shared>,
}

impl TcpTransport {
    pub fn new(host: String, port: u16, settings: Settings, sink: Sink) -> Self {
        let negotiator = Negotiator::new(&settings.term_type);
        Self {
            name: format!("{}:{}", host, port),
            host,
            port,
            settings,
            shared: Arc::new(Shared {
                state: StateCell::default(),
                stream: Mutex::new(None),
                negotiator: Mutex::new(negotiator),
                sink,
            }),
        }
    }

    pub fn connect(&self) {
        if !self.shared.state.begin() {
            return;
        }
        *lock(&self.shared.negotiator) = Negotiator::new(&self.settings.term_type);
        let shared = Arc::clone(&self.shared);
        let (host, port) = (self.host.clone(), self.port);
        let timeout = self.settings.connect_timeout;
        let spawned = thread::Builder::new()
            .name("telnet-reader".into())
            .spawn(move || {
                let reason = match run(&shared, &host, port, timeout) {
                    Ok(()) => "Connection closed".to_string(),
                    Err(e) => e.to_string(),
                };
                lock(&shared.stream).take();
                shared.state.set(State::Idle);
                info!("telnet {}:{} disconnected: {}", host, port, reason);
                shared.sink.event(Event::Disconnected(reason));
            });
        if let Err(e) = spawned {
            self.shared.state.set(State::Idle);
            self.shared.sink.event(Event::Disconnected(e.to_string()));
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        send(&self.shared, &escape_iac(data))?;
        let echo = lock(&self.shared.negotiator).echo_mode();
        if echo == EchoMode::Local || (echo == EchoMode::Unnegotiated && self.settings.local_echo) {
            self.shared.sink.event(Event::Data(echo_bytes(data)));
        }
        Ok(())
    }

    /// Answer a telnet command seen in the host stream
    pub fn negotiate(&self, command: &[u8]) {
        let reply = lock(&self.shared.negotiator).respond(command);
        debug!("telnet {:?} -> {:?}", command, reply);
        if !reply.is_empty() {
            if let Err(e) = send(&self.shared, &reply) {
                warn!("telnet negotiation reply not sent: {}", e);
            }
        }
    }

    pub fn echo_suppressed(&self) -> bool {
        lock(&self.shared.negotiator).echo_suppressed()
    }

    /// Shut the socket down; the reader sees EOF and reports
    pub fn disconnect(&self) {
        if let Some(stream) = lock(&self.shared.stream).as_ref() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("telnet socket shutdown: {}", e);
            }
        }
    }

    pub fn state(&self) -> State {
        self.shared.state.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn send(shared: &Shared, data: &[u8]) -> Result<(), TransportError> {
    let mut stream = lock(&shared.stream);
    let stream = stream.as_mut().ok_or(TransportError::NotConnected)?;
    stream.write_all(data)?;
    Ok(())
}

fn run(
    shared: &Arc<Shared>,
    host: &str,
    port: u16,
    timeout: std::time::Duration,
) -> Result<(), TransportError> {
    info!("connecting to telnet {}:{}", host, port);
    let mut stream = connect_tcp(host, port, timeout)?;
    *lock(&shared.stream) = Some(stream.try_clone()?);

    shared.state.set(State::Connected);
    shared.sink.event(Event::Connected);

    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => shared.sink.event(Event::Data(buf[..n].to_vec())),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
