//! A live SSH connection shared by the reader, tunnels and transfer jobs
//!
//! libssh2 is not reentrant across channels, so every call that touches the
//! session or one of its channels goes through [`SshLink::with`] or
//! [`SshLink::retry`], which hold one session-wide lock. The main
//! shell/subsystem channel lives inside that lock.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ssh2::{Channel, Session};
use tracing::{debug, trace};

use crate::transfer::tunnel::TunnelRegistry;
use crate::transfer::ChannelIo;
use crate::transport::error::WouldBlock;
use crate::transport::TransportError;
use crate::util::lock;

/// Upper bound on one readiness wait
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

pub struct SshLink {
    session: Session,
    socket: TcpStream,
    channel: Mutex<Option<Channel>>,
    tunnels: TunnelRegistry,
    closed: AtomicBool,
}

impl SshLink {
    pub fn new(session: Session, socket: TcpStream) -> Self {
        Self {
            session,
            socket,
            channel: Mutex::new(None),
            tunnels: TunnelRegistry::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<Channel>> {
        lock(&self.channel)
    }

    /// Run `f` under the session lock
    pub fn with<R>(&self, f: impl FnOnce(&Session, &mut Option<Channel>) -> R) -> R {
        let mut guard = self.guard();
        f(&self.session, &mut guard)
    }

    /// Run `f` under the session lock until it stops reporting would-block,
    /// releasing the lock and waiting for the socket between attempts
    pub fn retry<R, E>(
        &self,
        mut f: impl FnMut(&Session, &mut Option<Channel>) -> Result<R, E>,
    ) -> Result<R, TransportError>
    where
        E: WouldBlock + Into<TransportError>,
    {
        loop {
            if self.is_closed() {
                return Err(TransportError::NotConnected);
            }
            match self.with(&mut f) {
                Err(e) if e.would_block() => {
                    trace!("ssh call would block");
                    self.wait();
                }
                other => return other.map_err(Into::into),
            }
        }
    }

    /// Block until the socket is ready in the direction libssh2 is waiting
    /// on, or [`WAIT_INTERVAL`] passes
    #[cfg(unix)]
    pub fn wait(&self) {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        use ssh2::BlockDirections;
        use std::os::fd::AsFd;

        let flags = match self.session.block_directions() {
            BlockDirections::Outbound => PollFlags::POLLOUT,
            BlockDirections::Both => PollFlags::POLLIN | PollFlags::POLLOUT,
            _ => PollFlags::POLLIN,
        };
        let mut fds = [PollFd::new(self.socket.as_fd(), flags)];
        let timeout = PollTimeout::from(WAIT_INTERVAL.as_millis() as u16);
        if let Err(e) = poll(&mut fds, timeout) {
            trace!("poll failed: {}", e);
        }
    }

    #[cfg(not(unix))]
    pub fn wait(&self) {
        std::thread::sleep(Duration::from_millis(10));
    }

    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Force blocked readers out by shutting the socket down
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Tear down in order: tunnels, main channel, session, socket
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tunnels.close_all();
        self.with(|session, channel| {
            if let Some(mut ch) = channel.take() {
                let _ = ch.close();
            }
            let _ = session.disconnect(None, "closed by user", None);
        });
        let _ = self.socket.shutdown(Shutdown::Both);
        debug!("ssh link closed");
    }
}

/// A secondary channel (transfer or tunnel) that is only ever touched
/// under the session lock, and closed and freed under it on drop
pub struct LinkChannel<'a> {
    link: &'a SshLink,
    channel: Option<Channel>,
}

impl<'a> LinkChannel<'a> {
    pub fn new(link: &'a SshLink, channel: Channel) -> Self {
        Self {
            link,
            channel: Some(channel),
        }
    }

    pub fn retry<R, E>(&mut self, mut f: impl FnMut(&mut Channel) -> Result<R, E>) -> Result<R, TransportError>
    where
        E: WouldBlock + Into<TransportError>,
    {
        let channel = self.channel.as_mut().ok_or(TransportError::NotConnected)?;
        self.link.retry(|_, _| f(&mut *channel))
    }

    /// One attempt, no waiting
    pub fn with<R>(&mut self, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let channel = self.channel.as_mut()?;
        Some(self.link.with(|_, _| f(channel)))
    }

    pub fn eof(&mut self) -> bool {
        self.with(|ch| ch.eof()).unwrap_or(true)
    }
}

impl ChannelIo for LinkChannel<'_> {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.retry(|ch| ch.write(data))
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.retry(|ch| ch.read(&mut buf[..]))
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.with(|ch| ch.read(buf)) {
            Some(Ok(0)) if self.eof() => Ok(Some(0)),
            Some(Ok(0)) => Ok(None),
            Some(Ok(n)) => Ok(Some(n)),
            Some(Err(e)) if e.would_block() => Ok(None),
            Some(Err(e)) => Err(e),
            None => Ok(Some(0)),
        }
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        self.retry(|ch| ch.send_eof())?;
        self.retry(|ch| ch.wait_eof())
    }
}

impl Drop for LinkChannel<'_> {
    fn drop(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            self.link.with(move |_, _| {
                let _ = channel.close();
                drop(channel);
            });
        }
    }
}
