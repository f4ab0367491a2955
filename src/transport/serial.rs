//! Serial port transport

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::info;

use super::pipe::echo_bytes;
use super::{Event, Settings, Sink, State, StateCell, TransportError};
use crate::transfer::xmodem::Port;
use crate::util::lock;

/// Read timeout; also how often the reader checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Line settings: `baud[,parity,data,stop]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SerialSettings {
    pub baud: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: 9600,
            parity: Parity::None,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialSettings {
    /// Parse `9600`, `115200,e,7,2` and the like; omitted fields keep 9600,n,8,1
    pub fn parse(spec: &str) -> Option<Self> {
        let mut settings = Self::default();
        let mut parts = spec.split(',').map(str::trim);
        if let Some(baud) = parts.next().filter(|s| !s.is_empty()) {
            settings.baud = baud.parse().ok()?;
        }
        if let Some(parity) = parts.next() {
            settings.parity = match parity.to_ascii_lowercase().as_str() {
                "n" => Parity::None,
                "e" => Parity::Even,
                "o" => Parity::Odd,
                _ => return None,
            };
        }
        if let Some(data) = parts.next() {
            settings.data_bits = match data {
                "5" => DataBits::Five,
                "6" => DataBits::Six,
                "7" => DataBits::Seven,
                "8" => DataBits::Eight,
                _ => return None,
            };
        }
        if let Some(stop) = parts.next() {
            settings.stop_bits = match stop {
                "1" => StopBits::One,
                "2" => StopBits::Two,
                _ => return None,
            };
        }
        if parts.next().is_some() {
            return None;
        }
        Some(settings)
    }
}

struct Shared {
    state: StateCell,
    stop: AtomicBool,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// While set, received bytes go to a transfer job instead of the screen
    divert: Mutex<Option<Sender<Vec<u8>>>>,
    sink: Sink,
}

/// A serial port as a session
pub struct SerialTransport {
    port: String,
    line: SerialSettings,
    local_echo: bool,
    shared: Arc<Shared>,
}

impl SerialTransport {
    pub fn new(port: String, line: SerialSettings, settings: Settings, sink: Sink) -> Self {
        Self {
            port,
            line,
            local_echo: settings.local_echo,
            shared: Arc::new(Shared {
                state: StateCell::default(),
                stop: AtomicBool::new(false),
                writer: Mutex::new(None),
                divert: Mutex::new(None),
                sink,
            }),
        }
    }

    pub fn connect(&self) {
        if !self.shared.state.begin() {
            return;
        }
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let (name, line) = (self.port.clone(), self.line);
        let spawned = thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || {
                let reason = match run(&shared, &name, line) {
                    Ok(()) => format!("{} closed", name),
                    Err(e) => e.to_string(),
                };
                lock(&shared.writer).take();
                lock(&shared.divert).take();
                shared.state.set(State::Idle);
                info!("serial {} disconnected: {}", name, reason);
                shared.sink.event(Event::Disconnected(reason));
            });
        if let Err(e) = spawned {
            self.shared.state.set(State::Idle);
            self.shared.sink.event(Event::Disconnected(e.to_string()));
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        write_port(&self.shared, data)?;
        if self.local_echo {
            self.shared.sink.event(Event::Data(echo_bytes(data)));
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn state(&self) -> State {
        self.shared.state.get()
    }

    pub fn name(&self) -> &str {
        &self.port
    }

    /// Take over the byte stream for a transfer; dropping the link restores it
    pub fn divert(&self) -> Result<SerialLink, TransportError> {
        if self.state() != State::Connected {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = mpsc::channel();
        *lock(&self.shared.divert) = Some(tx);
        Ok(SerialLink {
            shared: Arc::clone(&self.shared),
            rx,
            pending: VecDeque::new(),
        })
    }
}

fn write_port(shared: &Shared, data: &[u8]) -> Result<(), TransportError> {
    let mut writer = lock(&shared.writer);
    let port = writer.as_mut().ok_or(TransportError::NotConnected)?;
    port.write_all(data)?;
    port.flush()?;
    Ok(())
}

fn run(shared: &Arc<Shared>, name: &str, line: SerialSettings) -> Result<(), TransportError> {
    info!("opening serial {} at {}", name, line.baud);
    let mut port = serialport::new(name, line.baud)
        .parity(line.parity)
        .data_bits(line.data_bits)
        .stop_bits(line.stop_bits)
        .timeout(POLL_INTERVAL)
        .open()?;
    let writer: Box<dyn SerialPort> = port.try_clone()?;
    *lock(&shared.writer) = Some(Box::new(writer));

    shared.state.set(State::Connected);
    shared.sink.event(Event::Connected);

    let mut buf = [0u8; 4096];
    while !shared.stop.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => deliver(shared, buf[..n].to_vec()),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Hand received bytes to a diverting transfer, or to the screen
fn deliver(shared: &Shared, chunk: Vec<u8>) {
    let chunk = match lock(&shared.divert).as_ref() {
        Some(tx) => match tx.send(chunk) {
            Ok(()) => return,
            Err(mpsc::SendError(chunk)) => chunk,
        },
        None => chunk,
    };
    shared.sink.event(Event::Data(chunk));
}

/// Exclusive byte stream over a connected serial port
pub struct SerialLink {
    shared: Arc<Shared>,
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl Port for SerialLink {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        write_port(&self.shared, data).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        if let Some(b) = self.pending.pop_front() {
            return Ok(Some(b));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                self.pending.extend(chunk);
                Ok(self.pending.pop_front())
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        lock(&self.shared.divert).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::xmodem::{self, packet, Check, Timing, ACK, CRC_MODE, EOT};
    use crate::transport::tests::Recorder;

    /// Captures what would go out on the line
    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<u8>>>);

    impl Write for Wire {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connected(rec: &Arc<Recorder>) -> (SerialTransport, Wire) {
        let serial = SerialTransport::new(
            "/dev/ttyTEST".into(),
            SerialSettings::default(),
            Settings::default(),
            rec.clone(),
        );
        let wire = Wire::default();
        *lock(&serial.shared.writer) = Some(Box::new(wire.clone()));
        serial.shared.state.set(State::Connected);
        (serial, wire)
    }

    #[test]
    fn test_diverted_link_owns_the_stream() {
        let rec = Arc::new(Recorder::default());
        let (serial, wire) = connected(&rec);
        let mut link = serial.divert().unwrap();
        deliver(&serial.shared, vec![0x15, b'C']);
        assert_eq!(link.recv(Duration::from_millis(100)).unwrap(), Some(0x15));
        assert_eq!(link.recv(Duration::from_millis(100)).unwrap(), Some(b'C'));
        assert_eq!(link.recv(Duration::from_millis(10)).unwrap(), None);
        link.send(&[0x04]).unwrap();
        assert_eq!(*wire.0.lock().unwrap(), vec![0x04]);
        assert!(rec.events.lock().unwrap().is_empty());

        drop(link);
        deliver(&serial.shared, b"login: ".to_vec());
        assert!(rec.output().contains("login: "));
    }

    #[test]
    fn test_xmodem_receive_over_link() {
        let rec = Arc::new(Recorder::default());
        let (serial, wire) = connected(&rec);
        let mut link = serial.divert().unwrap();
        let payload = b"hostname core-1\n".to_vec();
        deliver(&serial.shared, packet(1, &payload, Check::Crc16));
        deliver(&serial.shared, vec![EOT]);

        let timing = Timing {
            resend: Duration::from_millis(50),
            silence: Duration::from_secs(1),
        };
        let mut out = Vec::new();
        let stats = xmodem::receive(&mut link, &mut out, timing).unwrap();
        assert_eq!(out, payload);
        assert_eq!(stats.blocks, 1);
        assert_eq!(*wire.0.lock().unwrap(), vec![CRC_MODE, ACK, ACK]);
    }

    #[test]
    fn test_settings_parse() {
        assert_eq!(SerialSettings::parse("9600"), Some(SerialSettings::default()));
        let s = SerialSettings::parse("115200,e,7,2").unwrap();
        assert_eq!(s.baud, 115200);
        assert_eq!(s.parity, Parity::Even);
        assert_eq!(s.data_bits, DataBits::Seven);
        assert_eq!(s.stop_bits, StopBits::Two);
        assert!(SerialSettings::parse("fast").is_none());
        assert!(SerialSettings::parse("9600,x").is_none());
        assert!(SerialSettings::parse("9600,n,8,1,extra").is_none());
    }

    #[test]
    fn test_divert_requires_connection() {
        let rec = Arc::new(crate::transport::tests::Recorder::default());
        let serial = SerialTransport::new(
            "/dev/null-port".into(),
            SerialSettings::default(),
            Settings::default(),
            rec,
        );
        assert!(matches!(serial.divert(), Err(TransportError::NotConnected)));
    }
}
