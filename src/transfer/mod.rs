//! File transfer and port forwarding jobs
//!
//! - **scp**: single or wildcard file copy over an SSH link
//! - **sftp**: the interactive command set behind `sftp` sessions
//! - **xmodem**: block transfer over a serial port
//! - **tunnel**: local and remote TCP forwarding
//!
//! Jobs report into the session output and never tear the session down.

pub mod scp;
pub mod sftp;
pub mod tunnel;
pub mod xmodem;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Cannot open remote file {path}: {reason}")]
    RemoteOpen { path: String, reason: String },

    #[error("Cannot open local file {}: {source}", path.display())]
    LocalOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Transfer interrupted after {bytes} bytes: {reason}")]
    Interrupted { bytes: u64, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer aborted")]
    Aborted,

    #[error("{0}")]
    NotSupported(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Outcome of one completed file
#[derive(Debug, Clone, PartialEq)]
pub struct Transferred {
    pub name: String,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl fmt::Display for Transferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f64();
        write!(f, "{}: {} bytes in {:.1}s", self.name, self.bytes, secs)?;
        if secs > 0.0 {
            write!(f, " ({:.1} KB/s)", self.bytes as f64 / 1024.0 / secs)?;
        }
        Ok(())
    }
}

/// The SSH side of a transfer or relay
pub trait ChannelIo {
    /// Write part of `data`, waiting while the channel is busy
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read into `buf`, waiting until something arrives; 0 at end of stream
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// One read attempt: `None` when nothing is pending, `Some(0)` at end of stream
    fn poll_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Send end-of-file and wait for the peer to acknowledge it
    fn finish(&mut self) -> Result<(), TransportError>;
}

/// Write all of `data`, resuming after short writes
pub fn send_all(channel: &mut dyn ChannelIo, data: &[u8]) -> Result<(), TransportError> {
    let mut offset = 0;
    while offset < data.len() {
        match channel.send(&data[offset..])? {
            0 => return Err(TransportError::NotConnected),
            n => offset += n,
        }
    }
    Ok(())
}

/// Whether a name contains glob metacharacters
pub fn has_wildcard(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

/// Last component of a `/`-separated remote path
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted channel: `incoming` is what the host sends, `sent` records
    /// each write. Writes accept at most `max_write` bytes.
    pub struct FakeChannel {
        pub incoming: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
        pub max_write: usize,
        /// Hold `incoming` back until something has been sent
        pub gated: bool,
        pub finished: bool,
    }

    impl FakeChannel {
        pub fn new(incoming: &[&[u8]]) -> Self {
            Self {
                incoming: incoming.iter().map(|c| c.to_vec()).collect(),
                sent: Vec::new(),
                max_write: usize::MAX,
                gated: false,
                finished: false,
            }
        }

        /// Answers with `incoming` once a request has arrived
        pub fn replying(incoming: &[&[u8]]) -> Self {
            Self {
                gated: true,
                ..Self::new(incoming)
            }
        }

        pub fn sent_bytes(&self) -> Vec<u8> {
            self.sent.concat()
        }

        fn take(&mut self, buf: &mut [u8]) -> usize {
            let Some(mut chunk) = self.incoming.pop_front() else {
                return 0;
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.incoming.push_front(chunk.split_off(n));
            }
            n
        }
    }

    impl ChannelIo for FakeChannel {
        fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            let n = data.len().min(self.max_write);
            self.sent.push(data[..n].to_vec());
            Ok(n)
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            Ok(self.take(buf))
        }

        fn poll_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            if self.gated && self.sent.is_empty() {
                return Ok(None);
            }
            Ok(Some(self.take(buf)))
        }

        fn finish(&mut self) -> Result<(), TransportError> {
            self.finished = true;
            Ok(())
        }
    }

    #[test]
    fn test_send_all_resumes_short_writes() {
        let mut channel = FakeChannel::new(&[]);
        channel.max_write = 4;
        send_all(&mut channel, b"0123456789").unwrap();
        assert_eq!(channel.sent, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);

        channel.max_write = 0;
        assert!(matches!(send_all(&mut channel, b"x"), Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_summary_line() {
        let t = Transferred {
            name: "fw.bin".into(),
            bytes: 2048,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(t.to_string(), "fw.bin: 2048 bytes in 2.0s (1.0 KB/s)");
        let t = Transferred {
            elapsed: Duration::ZERO,
            ..t
        };
        assert_eq!(t.to_string(), "fw.bin: 2048 bytes in 0.0s");
    }

    #[test]
    fn test_path_helpers() {
        assert!(has_wildcard("*.log"));
        assert!(has_wildcard("conf[12]"));
        assert!(!has_wildcard("plain.txt"));
        assert_eq!(base_name("/var/log/messages"), "messages");
        assert_eq!(base_name("dir/"), "dir");
        assert_eq!(base_name("file"), "file");
    }

    #[test]
    fn test_error_messages() {
        let e = TransferError::Interrupted {
            bytes: 4096,
            reason: "channel closed".into(),
        };
        assert_eq!(e.to_string(), "Transfer interrupted after 4096 bytes: channel closed");
    }
}
