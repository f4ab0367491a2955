//! Local process transport

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Event, Settings, Sink, State, StateCell, TransportError};
use crate::util::lock;

/// Pause between exit checks once the child's output has closed
const REAP_INTERVAL: Duration = Duration::from_millis(50);

struct Shared {
    state: StateCell,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    sink: Sink,
}

/// A command's stdin/stdout as a session
pub struct PipeTransport {
    command: String,
    local_echo: bool,
    shared: Arc<Shared>,
}

impl PipeTransport {
    pub fn new(command: String, settings: Settings, sink: Sink) -> Self {
        Self {
            command,
            local_echo: settings.local_echo,
            shared: Arc::new(Shared {
                state: StateCell::default(),
                child: Mutex::new(None),
                stdin: Mutex::new(None),
                sink,
            }),
        }
    }

    pub fn connect(&self) {
        if !self.shared.state.begin() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let command = self.command.clone();
        let spawned = thread::Builder::new()
            .name("pipe-reader".into())
            .spawn(move || {
                let reason = match run(&shared, &command) {
                    Ok(()) => "Process exited".to_string(),
                    Err(e) => e.to_string(),
                };
                lock(&shared.stdin).take();
                lock(&shared.child).take();
                shared.state.set(State::Idle);
                info!("pipe '{}' closed: {}", command, reason);
                shared.sink.event(Event::Disconnected(reason));
            });
        if let Err(e) = spawned {
            self.shared.state.set(State::Idle);
            self.shared.sink.event(Event::Disconnected(e.to_string()));
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        {
            let mut stdin = lock(&self.shared.stdin);
            let pipe = stdin.as_mut().ok_or(TransportError::NotConnected)?;
            pipe.write_all(data)?;
            pipe.flush()?;
        }
        if self.local_echo {
            self.shared.sink.event(Event::Data(echo_bytes(data)));
        }
        Ok(())
    }

    /// Kill the child; the reader sees EOF and reports
    pub fn disconnect(&self) {
        if let Some(child) = lock(&self.shared.child).as_mut() {
            if let Err(e) = child.kill() {
                warn!("failed to kill '{}': {}", self.command, e);
            }
        }
        lock(&self.shared.stdin).take();
    }

    pub fn state(&self) -> State {
        self.shared.state.get()
    }

    pub fn name(&self) -> &str {
        &self.command
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

fn run(shared: &Arc<Shared>, command: &str) -> Result<(), TransportError> {
    info!("starting pipe '{}'", command);
    let mut child = shell_command(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    *lock(&shared.stdin) = child.stdin.take();
    *lock(&shared.child) = Some(child);

    shared.state.set(State::Connected);
    shared.sink.event(Event::Connected);

    let err_reader = stderr.map(|mut err| {
        let sink = Arc::clone(&shared.sink);
        thread::spawn(move || forward(&mut err, &*sink))
    });
    if let Some(mut out) = stdout {
        forward(&mut out, &*shared.sink);
    }
    if let Some(handle) = err_reader {
        let _ = handle.join();
    }
    reap(shared);
    Ok(())
}

/// Wait for the child without holding its lock, so `disconnect` can kill it
fn reap(shared: &Shared) {
    loop {
        let status = match lock(&shared.child).as_mut() {
            Some(child) => child.try_wait(),
            None => return,
        };
        match status {
            Ok(None) => thread::sleep(REAP_INTERVAL),
            Ok(Some(status)) => {
                debug!("pipe child exited: {}", status);
                return;
            }
            Err(e) => {
                warn!("cannot wait for pipe child: {}", e);
                return;
            }
        }
    }
}

fn forward(reader: &mut impl Read, sink: &dyn super::Frontend) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => sink.event(Event::Data(buf[..n].to_vec())),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Local echo: CR is shown as CR LF
pub(crate) fn echo_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    for &b in data {
        out.push(b);
        if b == b'\r' {
            out.push(b'\n');
        }
    }
    out
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::tests::Recorder;
    use std::time::{Duration, Instant};

    fn wait_for_disconnect(rec: &Recorder) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if rec
                .events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, Event::Disconnected(_)))
            {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("pipe never disconnected");
    }

    #[test]
    fn test_pipe_reports_output_and_exit() {
        let rec = Arc::new(Recorder::default());
        let pipe = PipeTransport::new("echo hello".into(), Settings::default(), rec.clone());
        pipe.connect();
        wait_for_disconnect(&rec);
        let events = rec.events.lock().unwrap().clone();
        assert_eq!(events.first(), Some(&Event::Connected));
        assert!(rec.output().contains("hello"));
        assert_eq!(pipe.state(), State::Idle);
    }

    #[test]
    fn test_pipe_write_reaches_child() {
        let rec = Arc::new(Recorder::default());
        let pipe = PipeTransport::new("head -n 1".into(), Settings::default(), rec.clone());
        pipe.connect();
        let deadline = Instant::now() + Duration::from_secs(10);
        while pipe.state() != State::Connected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        pipe.write(b"ping\n").unwrap();
        wait_for_disconnect(&rec);
        assert!(rec.output().contains("ping"));
    }

    #[test]
    fn test_disconnect_kills_child_with_closed_output() {
        let rec = Arc::new(Recorder::default());
        let pipe = PipeTransport::new("exec >&- 2>&-; sleep 30".into(), Settings::default(), rec.clone());
        pipe.connect();
        let deadline = Instant::now() + Duration::from_secs(10);
        while pipe.state() != State::Connected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        pipe.disconnect();
        assert!(started.elapsed() < Duration::from_secs(2));
        wait_for_disconnect(&rec);
        assert_eq!(pipe.state(), State::Idle);
    }

    #[test]
    fn test_echo_bytes() {
        assert_eq!(echo_bytes(b"ls\r"), b"ls\r\n");
    }
}
