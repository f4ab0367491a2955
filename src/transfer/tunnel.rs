//! TCP port forwarding over an SSH link
//!
//! - local (`L:`): listen here, open a direct-tcpip channel per connection
//! - remote (`R:`): ask the server to listen, connect out per forwarded channel
//!
//! Every listener and relay runs on its own thread; the registry keeps the
//! stop flags so the owning session can tear them all down at once. A
//! listener that ends for any reason removes its own entry.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ssh2::Channel;
use tracing::{debug, info, warn};

use super::{send_all, ChannelIo, TransferError};
use crate::transport::error::WouldBlock;
use crate::transport::ssh::link::LinkChannel;
use crate::transport::ssh::SshLink;
use crate::util::lock;

/// How long a relay blocks on its socket before servicing the channel
const SOCKET_POLL: Duration = Duration::from_millis(10);
const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSpec {
    Local {
        bind_host: String,
        bind_port: u16,
        host: String,
        port: u16,
    },
    Remote {
        bind_host: String,
        bind_port: u16,
        host: String,
        port: u16,
    },
}

impl TunnelSpec {
    /// `[L:]lhost:lport:rhost:rport`, `lport:rhost:rport`, or
    /// `R:rhost:rport:lhost:lport`
    pub fn parse(spec: &str) -> Result<Self, TransferError> {
        const USAGE: &str = "tun [L:]lhost:lport:rhost:rport | tun R:rhost:rport:lhost:lport";
        let (remote, rest) = match spec.split_once(':') {
            Some((kind, rest)) if kind.eq_ignore_ascii_case("r") => (true, rest),
            Some((kind, rest)) if kind.eq_ignore_ascii_case("l") => (false, rest),
            _ => (false, spec),
        };
        let parts: Vec<&str> = rest.split(':').collect();
        let (bind_host, bind_port, host, port) = match parts.as_slice() {
            [bh, bp, h, p] => (*bh, *bp, *h, *p),
            [bp, h, p] => ("127.0.0.1", *bp, *h, *p),
            _ => return Err(TransferError::Usage(USAGE)),
        };
        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| TransferError::Usage(USAGE));
        let (bind_port, port) = (parse_port(bind_port)?, parse_port(port)?);
        if host.is_empty() || port == 0 {
            return Err(TransferError::Usage(USAGE));
        }
        let bind_host = if bind_host.is_empty() { "127.0.0.1" } else { bind_host }.to_string();
        let host = host.to_string();
        Ok(if remote {
            TunnelSpec::Remote {
                bind_host,
                bind_port,
                host,
                port,
            }
        } else {
            TunnelSpec::Local {
                bind_host,
                bind_port,
                host,
                port,
            }
        })
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelSpec::Local {
                bind_host,
                bind_port,
                host,
                port,
            } => write!(f, "L {}:{} -> {}:{}", bind_host, bind_port, host, port),
            TunnelSpec::Remote {
                bind_host,
                bind_port,
                host,
                port,
            } => write!(f, "R {}:{} -> {}:{}", bind_host, bind_port, host, port),
        }
    }
}

/// Stop flag and live relay count shared by a listener and its relays
#[derive(Debug, Default)]
pub struct Control {
    stop: AtomicBool,
    relays: AtomicUsize,
}

impl Control {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

struct Entry {
    /// Port actually bound, the key for `close`
    port: u16,
    spec: TunnelSpec,
    control: Arc<Control>,
}

type Entries = Arc<Mutex<Vec<Entry>>>;

/// Active tunnels of one SSH session
#[derive(Default)]
pub struct TunnelRegistry {
    entries: Entries,
}

/// A listener's hold on its registry entry; dropping it deregisters the
/// tunnel, leaving any later tunnel on the same port alone
struct Registration {
    entries: Entries,
    control: Arc<Control>,
}

impl Registration {
    fn control(&self) -> &Arc<Control> {
        &self.control
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&self.entries).retain(|e| !Arc::ptr_eq(&e.control, &self.control));
    }
}

impl TunnelRegistry {
    fn insert(&self, port: u16, spec: TunnelSpec) -> Registration {
        let control = Arc::new(Control::default());
        lock(&self.entries).push(Entry {
            port,
            spec,
            control: Arc::clone(&control),
        });
        Registration {
            entries: Arc::clone(&self.entries),
            control,
        }
    }

    /// One line per tunnel
    pub fn list(&self) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .map(|e| {
                format!(
                    "{:>5}  {}  ({} open)",
                    e.port,
                    e.spec,
                    e.control.relays.load(Ordering::Acquire)
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the tunnel bound to `port`, with its relays
    pub fn close(&self, port: u16) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|e| {
            if e.port == port {
                e.control.stop.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
        entries.len() != before
    }

    pub fn close_all(&self) {
        for e in lock(&self.entries).drain(..) {
            e.control.stop.store(true, Ordering::Release);
            info!("tunnel {} closed", e.spec);
        }
    }
}

/// Start a tunnel; returns the port it listens on
pub fn open(link: &Arc<SshLink>, spec: TunnelSpec) -> Result<u16, TransferError> {
    match &spec {
        TunnelSpec::Local { .. } => open_local(link, spec),
        TunnelSpec::Remote { .. } => open_remote(link, spec),
    }
}

fn open_local(link: &Arc<SshLink>, spec: TunnelSpec) -> Result<u16, TransferError> {
    let TunnelSpec::Local {
        bind_host,
        bind_port,
        host,
        port,
    } = &spec
    else {
        return Err(TransferError::NotSupported("not a local tunnel".into()));
    };
    let listener = TcpListener::bind((bind_host.as_str(), *bind_port))
        .and_then(|l| l.set_nonblocking(true).map(|_| l))
        .map_err(|e| TransferError::NotSupported(format!("cannot listen on {}:{}: {}", bind_host, bind_port, e)))?;
    let bound = listener.local_addr().map(|a| a.port()).unwrap_or(*bind_port);
    let (host, port) = (host.clone(), *port);
    let registration = link.tunnels().insert(bound, spec.clone());
    info!("tunnel {} listening on {}", spec, bound);

    let link = Arc::clone(link);
    thread::Builder::new()
        .name(format!("tunnel-{}", bound))
        .spawn(move || {
            let control = registration.control();
            while !control.stopped() && !link.is_closed() {
                match listener.accept() {
                    Ok((socket, peer)) => {
                        debug!("tunnel {} accepted {}", bound, peer);
                        let (link, control, host) = (Arc::clone(&link), Arc::clone(control), host.clone());
                        let peer = (peer.ip().to_string(), peer.port());
                        spawn_relay(control, move |control| {
                            let channel = link.retry(|session, _| {
                                session.channel_direct_tcpip(&host, port, Some((&peer.0, peer.1)))
                            });
                            match channel {
                                Ok(channel) => relay(&link, channel, socket, control),
                                Err(e) => warn!("direct-tcpip to {}:{} failed: {}", host, port, e),
                            }
                        });
                    }
                    Err(e) if e.would_block() => thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        warn!("tunnel {} accept failed: {}", bound, e);
                        break;
                    }
                }
            }
            debug!("tunnel listener {} stopped", bound);
        })
        .map_err(|e| TransferError::NotSupported(e.to_string()))?;
    Ok(bound)
}

fn open_remote(link: &Arc<SshLink>, spec: TunnelSpec) -> Result<u16, TransferError> {
    let TunnelSpec::Remote {
        bind_host,
        bind_port,
        host,
        port,
    } = &spec
    else {
        return Err(TransferError::NotSupported("not a remote tunnel".into()));
    };
    let (listener, bound) = link
        .retry(|session, _| session.channel_forward_listen(*bind_port, Some(bind_host.as_str()), None))
        .map_err(|e| TransferError::Protocol(format!("remote listen on {}:{} refused: {}", bind_host, bind_port, e)))?;
    let (host, port) = (host.clone(), *port);
    let registration = link.tunnels().insert(bound, spec.clone());
    info!("tunnel {} listening remotely on {}", spec, bound);

    let link = Arc::clone(link);
    thread::Builder::new()
        .name(format!("tunnel-r{}", bound))
        .spawn(move || {
            let control = registration.control();
            let mut listener = Some(listener);
            while !control.stopped() && !link.is_closed() {
                let accepted = link.with(|_, _| listener.as_mut().map(|l| l.accept()));
                match accepted {
                    Some(Ok(channel)) => {
                        let (link, control, host) = (Arc::clone(&link), Arc::clone(control), host.clone());
                        spawn_relay(control, move |control| match TcpStream::connect((host.as_str(), port)) {
                            Ok(socket) => relay(&link, channel, socket, control),
                            Err(e) => {
                                warn!("tunnel connect to {}:{} failed: {}", host, port, e);
                                link.with(move |_, _| drop(channel));
                            }
                        });
                    }
                    Some(Err(e)) if e.would_block() => link.wait(),
                    Some(Err(e)) => {
                        warn!("remote tunnel {} accept failed: {}", bound, e);
                        break;
                    }
                    None => break,
                }
            }
            link.with(|_, _| drop(listener.take()));
            debug!("remote tunnel {} stopped", bound);
        })
        .map_err(|e| TransferError::NotSupported(e.to_string()))?;
    Ok(bound)
}

fn spawn_relay(control: Arc<Control>, work: impl FnOnce(&Control) + Send + 'static) {
    control.relays.fetch_add(1, Ordering::AcqRel);
    let spawned = thread::Builder::new().name("tunnel-relay".into()).spawn({
        let control = Arc::clone(&control);
        move || {
            work(&control);
            control.relays.fetch_sub(1, Ordering::AcqRel);
        }
    });
    if let Err(e) = spawned {
        control.relays.fetch_sub(1, Ordering::AcqRel);
        warn!("cannot start relay: {}", e);
    }
}

/// Copy both ways until either side closes or the tunnel stops
fn relay(link: &SshLink, channel: Channel, mut socket: TcpStream, control: &Control) {
    let mut channel = LinkChannel::new(link, channel);
    let stopped = || control.stopped() || link.is_closed();
    let result = socket
        .set_nonblocking(false)
        .and_then(|_| socket.set_read_timeout(Some(SOCKET_POLL)))
        .and_then(|_| pump(&mut channel, &mut socket, &stopped));
    if let Err(e) = result {
        debug!("relay ended: {}", e);
    }
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        debug!("relay socket shutdown: {}", e);
    }
}

/// Alternate between the socket (blocking up to its read timeout) and one
/// non-waiting channel read
fn pump(channel: &mut dyn ChannelIo, socket: &mut TcpStream, stopped: &dyn Fn() -> bool) -> io::Result<()> {
    let mut up = vec![0u8; 16 * 1024];
    let mut down = vec![0u8; 16 * 1024];
    loop {
        if stopped() {
            return Ok(());
        }
        match socket.read(&mut up) {
            Ok(0) => return Ok(()),
            Ok(n) => send_all(channel, &up[..n])
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        match channel.poll_recv(&mut down)? {
            Some(0) => return Ok(()),
            Some(n) => socket.write_all(&down[..n])?,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::tests::FakeChannel;

    #[test]
    fn test_parse_local_forms() {
        assert_eq!(
            TunnelSpec::parse("L:0.0.0.0:8080:db:5432").unwrap(),
            TunnelSpec::Local {
                bind_host: "0.0.0.0".into(),
                bind_port: 8080,
                host: "db".into(),
                port: 5432,
            }
        );
        assert_eq!(
            TunnelSpec::parse("localhost:2222:10.1.1.1:22").unwrap(),
            TunnelSpec::Local {
                bind_host: "localhost".into(),
                bind_port: 2222,
                host: "10.1.1.1".into(),
                port: 22,
            }
        );
        assert_eq!(
            TunnelSpec::parse("8080:web:80").unwrap(),
            TunnelSpec::Local {
                bind_host: "127.0.0.1".into(),
                bind_port: 8080,
                host: "web".into(),
                port: 80,
            }
        );
    }

    #[test]
    fn test_parse_remote() {
        let spec = TunnelSpec::parse("R:0.0.0.0:9000:localhost:3000").unwrap();
        assert_eq!(
            spec,
            TunnelSpec::Remote {
                bind_host: "0.0.0.0".into(),
                bind_port: 9000,
                host: "localhost".into(),
                port: 3000,
            }
        );
        assert_eq!(spec.to_string(), "R 0.0.0.0:9000 -> localhost:3000");
    }

    #[test]
    fn test_parse_rejects() {
        assert!(TunnelSpec::parse("8080").is_err());
        assert!(TunnelSpec::parse("L:a:b:c:d").is_err());
        assert!(TunnelSpec::parse("1:2:3:4:5").is_err());
        assert!(TunnelSpec::parse("8080:web:0").is_err());
    }

    #[test]
    fn test_registry_close() {
        let registry = TunnelRegistry::default();
        let spec = TunnelSpec::parse("8080:web:80").unwrap();
        let a = registry.insert(8080, spec.clone());
        let b = registry.insert(8081, spec);
        assert_eq!(registry.list().len(), 2);
        assert!(registry.list()[0].contains("L 127.0.0.1:8080 -> web:80"));

        assert!(registry.close(8080));
        assert!(!registry.close(8080));
        assert!(a.control().stopped());
        assert!(!b.control().stopped());

        registry.close_all();
        assert!(b.control().stopped());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ended_listener_deregisters() {
        let registry = TunnelRegistry::default();
        let spec = TunnelSpec::parse("8080:web:80").unwrap();
        let dead = registry.insert(8080, spec.clone());
        let other = registry.insert(8081, spec.clone());
        drop(dead);
        assert_eq!(registry.len(), 1);
        assert!(registry.list()[0].starts_with(" 8081"));

        // a closed tunnel's listener exiting late leaves a reopened port alone
        assert!(registry.close(8081));
        let reopened = registry.insert(8081, spec);
        drop(other);
        assert_eq!(registry.len(), 1);
        drop(reopened);
        assert!(registry.is_empty());
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_read_timeout(Some(SOCKET_POLL)).unwrap();
        (client, server)
    }

    #[test]
    fn test_pump_relays_both_ways() {
        let (mut client, mut server) = socket_pair();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        let mut channel = FakeChannel::replying(&[b"HTTP/1.0 200 OK\r\n"]);
        channel.max_write = 5;
        pump(&mut channel, &mut server, &|| false).unwrap();
        assert_eq!(channel.sent_bytes(), b"GET / HTTP/1.0\r\n\r\n");

        let mut reply = [0u8; 17];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"HTTP/1.0 200 OK\r\n");
    }

    #[test]
    fn test_pump_ends_when_client_closes() {
        let (client, mut server) = socket_pair();
        client.shutdown(Shutdown::Write).unwrap();
        let mut channel = FakeChannel::replying(&[b"never sent"]);
        pump(&mut channel, &mut server, &|| false).unwrap();
        assert!(channel.sent.is_empty());
        assert_eq!(channel.incoming.len(), 1);
    }

    #[test]
    fn test_pump_honours_stop() {
        let (_client, mut server) = socket_pair();
        let mut channel = FakeChannel::replying(&[b"x"]);
        pump(&mut channel, &mut server, &|| true).unwrap();
        assert!(channel.sent.is_empty());
    }
}
