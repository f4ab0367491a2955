//! XMODEM file transfer
//!
//! 128-byte blocks framed as `SOH seq !seq data check`, where the check is
//! an 8-bit sum or, when the receiver opened with `C`, a CRC-16. The sender
//! resends every ten seconds while waiting and gives up after sixty seconds
//! without hearing anything.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::TransferError;

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;
pub const CRC_MODE: u8 = b'C';
/// Padding for the final block
pub const SUB: u8 = 0x1a;

pub const BLOCK: usize = 128;

/// `C` requests before a receiver falls back to checksums
const CRC_ATTEMPTS: u32 = 3;

/// Byte-level access to the line a transfer runs over
pub trait Port {
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// One byte, or `None` when nothing arrived within `timeout`
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<u8>>;
}

/// Retry and abort intervals
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub resend: Duration,
    pub silence: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            resend: Duration::from_secs(10),
            silence: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Checksum,
    Crc16,
}

impl Check {
    fn len(self) -> usize {
        match self {
            Check::Checksum => 1,
            Check::Crc16 => 2,
        }
    }

    fn compute(self, data: &[u8]) -> Vec<u8> {
        match self {
            Check::Checksum => vec![checksum(data)],
            Check::Crc16 => crc16(data).to_be_bytes().to_vec(),
        }
    }
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |mut crc, &b| {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Frame one block; short payloads are padded with SUB
pub fn packet(seq: u8, payload: &[u8], check: Check) -> Vec<u8> {
    let mut data = [SUB; BLOCK];
    data[..payload.len()].copy_from_slice(payload);
    let mut p = Vec::with_capacity(3 + BLOCK + 2);
    p.extend_from_slice(&[SOH, seq, !seq]);
    p.extend_from_slice(&data);
    p.extend_from_slice(&check.compute(&data));
    p
}

/// Totals for a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub blocks: usize,
    pub bytes: u64,
    pub retries: usize,
}

/// Tracks time since the other side was last heard from
struct Line<'a> {
    port: &'a mut dyn Port,
    timing: Timing,
    heard: Instant,
}

impl<'a> Line<'a> {
    fn new(port: &'a mut dyn Port, timing: Timing) -> Self {
        Self {
            port,
            timing,
            heard: Instant::now(),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.port.send(data).map_err(|e| TransferError::Protocol(e.to_string()))
    }

    /// Next byte within `timeout`; aborts once the line has been silent
    /// for the whole silence interval
    fn recv(&mut self, timeout: Duration) -> Result<Option<u8>, TransferError> {
        let left = self.timing.silence.saturating_sub(self.heard.elapsed());
        if left.is_zero() {
            return Err(TransferError::Aborted);
        }
        match self.port.recv(timeout.min(left)) {
            Ok(Some(b)) => {
                self.heard = Instant::now();
                Ok(Some(b))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(TransferError::Protocol(e.to_string())),
        }
    }

    /// Wait for one of `wanted`, up to the resend interval. CAN aborts;
    /// anything else is line noise.
    fn expect(&mut self, wanted: &[u8]) -> Result<Option<u8>, TransferError> {
        let deadline = Instant::now() + self.timing.resend;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            match self.recv(left)? {
                Some(CAN) => return Err(TransferError::Aborted),
                Some(b) if wanted.contains(&b) => return Ok(Some(b)),
                Some(_) => {}
                None => return Ok(None),
            }
        }
    }
}

/// Send `data`, negotiating the check mode from the receiver's opening byte
pub fn send(port: &mut dyn Port, data: &[u8], timing: Timing) -> Result<Stats, TransferError> {
    let mut line = Line::new(port, timing);
    let check = loop {
        match line.expect(&[CRC_MODE, NAK])? {
            Some(CRC_MODE) => break Check::Crc16,
            Some(_) => break Check::Checksum,
            None => continue,
        }
    };
    debug!("xmodem send using {:?}", check);

    let mut stats = Stats {
        blocks: 0,
        bytes: 0,
        retries: 0,
    };
    for (i, payload) in data.chunks(BLOCK).enumerate() {
        let seq = (i + 1) as u8;
        let frame = packet(seq, payload, check);
        line.send(&frame)?;
        loop {
            match line.expect(&[ACK, NAK])? {
                Some(ACK) => break,
                _ => {
                    stats.retries += 1;
                    line.send(&frame)?;
                }
            }
        }
        stats.blocks += 1;
        stats.bytes += payload.len() as u64;
    }

    line.send(&[EOT])?;
    loop {
        match line.expect(&[ACK, NAK])? {
            Some(ACK) => break,
            _ => line.send(&[EOT])?,
        }
    }
    info!("xmodem sent {} blocks, {} retries", stats.blocks, stats.retries);
    Ok(stats)
}

/// Receive into `out`. Trailing SUB padding of the final block is dropped.
pub fn receive(port: &mut dyn Port, out: &mut dyn Write, timing: Timing) -> Result<Stats, TransferError> {
    let mut line = Line::new(port, timing);
    let mut check = Check::Crc16;
    let mut requests = 0;
    let mut expected: u8 = 1;
    let mut pending: Option<Vec<u8>> = None;
    let mut stats = Stats {
        blocks: 0,
        bytes: 0,
        retries: 0,
    };
    let mut started = false;

    line.send(&[CRC_MODE])?;
    requests += 1;
    loop {
        let first = line.expect(&[SOH, EOT])?;
        match first {
            None => {
                if !started {
                    if requests >= CRC_ATTEMPTS {
                        check = Check::Checksum;
                    }
                    requests += 1;
                    let open = if check == Check::Crc16 { CRC_MODE } else { NAK };
                    line.send(&[open])?;
                } else {
                    stats.retries += 1;
                    line.send(&[NAK])?;
                }
            }
            Some(EOT) => {
                line.send(&[ACK])?;
                if let Some(mut last) = pending.take() {
                    while last.last() == Some(&SUB) {
                        last.pop();
                    }
                    write_block(out, &last, &mut stats)?;
                }
                info!("xmodem received {} blocks", stats.blocks);
                return Ok(stats);
            }
            Some(_) => {
                started = true;
                match read_block(&mut line, check)? {
                    Some((seq, data)) if seq == expected => {
                        if let Some(prev) = pending.replace(data) {
                            write_block(out, &prev, &mut stats)?;
                        }
                        stats.blocks += 1;
                        expected = expected.wrapping_add(1);
                        line.send(&[ACK])?;
                    }
                    Some((seq, _)) if seq == expected.wrapping_sub(1) => {
                        line.send(&[ACK])?;
                    }
                    Some((seq, _)) => {
                        line.send(&[CAN, CAN])?;
                        return Err(TransferError::Protocol(format!(
                            "block {} out of sequence, expected {}",
                            seq, expected
                        )));
                    }
                    None => {
                        stats.retries += 1;
                        line.send(&[NAK])?;
                    }
                }
            }
        }
    }
}

/// Rest of a block after SOH; `None` if it was short or corrupt
fn read_block(line: &mut Line<'_>, check: Check) -> Result<Option<(u8, Vec<u8>)>, TransferError> {
    let len = 2 + BLOCK + check.len();
    let mut frame = Vec::with_capacity(len);
    while frame.len() < len {
        match line.recv(line.timing.resend)? {
            Some(b) => frame.push(b),
            None => return Ok(None),
        }
    }
    let (seq, inverse) = (frame[0], frame[1]);
    let data = &frame[2..2 + BLOCK];
    if seq != !inverse || frame[2 + BLOCK..] != check.compute(data)[..] {
        return Ok(None);
    }
    Ok(Some((seq, data.to_vec())))
}

fn write_block(out: &mut dyn Write, data: &[u8], stats: &mut Stats) -> Result<(), TransferError> {
    out.write_all(data).map_err(|e| TransferError::Interrupted {
        bytes: stats.bytes,
        reason: e.to_string(),
    })?;
    stats.bytes += data.len() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted bytes; `None` entries are timeouts
    struct FakePort {
        script: VecDeque<Option<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl FakePort {
        fn new(script: &[Option<u8>]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                sent: Vec::new(),
            }
        }
    }

    impl Port for FakePort {
        fn send(&mut self, data: &[u8]) -> io::Result<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn recv(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
            match self.script.pop_front() {
                Some(b) => Ok(b),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }

    fn fast() -> Timing {
        Timing {
            resend: Duration::from_millis(20),
            silence: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
        assert_eq!(checksum(&[0xff, 0x02]), 0x01);
    }

    #[test]
    fn test_nak_resends_same_block() {
        let mut port = FakePort::new(&[Some(CRC_MODE), Some(NAK), Some(ACK), Some(ACK)]);
        let stats = send(&mut port, b"hello", fast()).unwrap();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.retries, 1);
        assert_eq!(port.sent.len(), 3);
        assert_eq!(port.sent[0], port.sent[1]);
        assert_eq!(&port.sent[0][..3], &[SOH, 1, 0xfe]);
        assert_eq!(port.sent[0].len(), 3 + BLOCK + 2);
        assert_eq!(port.sent[2], vec![EOT]);
    }

    #[test]
    fn test_nothing_sent_after_eot_ack() {
        let data = vec![0x42u8; BLOCK + 10];
        let mut port = FakePort::new(&[Some(NAK), Some(ACK), Some(ACK), Some(ACK), Some(NAK), Some(ACK)]);
        let stats = send(&mut port, &data, fast()).unwrap();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.bytes, data.len() as u64);
        assert_eq!(port.sent.last().unwrap(), &vec![EOT]);
        assert_eq!(port.sent[1][1], 2);
        assert_eq!(port.sent[0].len(), 3 + BLOCK + 1);
        // the trailing NAK and ACK are never read
        assert_eq!(port.script.len(), 2);
    }

    #[test]
    fn test_silent_receiver_aborts() {
        let mut port = FakePort::new(&[]);
        let err = send(&mut port, b"data", fast()).unwrap_err();
        assert!(matches!(err, TransferError::Aborted));
    }

    #[test]
    fn test_cancel_aborts() {
        let mut port = FakePort::new(&[Some(CRC_MODE), Some(CAN)]);
        assert!(matches!(send(&mut port, b"x", fast()), Err(TransferError::Aborted)));
    }

    fn script(frames: &[Vec<u8>]) -> Vec<Option<u8>> {
        frames.iter().flatten().map(|&b| Some(b)).collect()
    }

    #[test]
    fn test_receive_crc_blocks() {
        let payload = b"show running-config\n".to_vec();
        let frames = vec![packet(1, &payload, Check::Crc16), vec![EOT]];
        let mut port = FakePort::new(&script(&frames));
        let mut out = Vec::new();
        let stats = receive(&mut port, &mut out, fast()).unwrap();
        assert_eq!(out, payload);
        assert_eq!(stats.blocks, 1);
        assert_eq!(port.sent, vec![vec![CRC_MODE], vec![ACK], vec![ACK]]);
    }

    #[test]
    fn test_receive_naks_corrupt_block() {
        let mut bad = packet(1, b"abc", Check::Crc16);
        bad[10] ^= 0xff;
        let frames = vec![bad, packet(1, b"abc", Check::Crc16), packet(1, b"abc", Check::Crc16), vec![EOT]];
        let mut port = FakePort::new(&script(&frames));
        let mut out = Vec::new();
        let stats = receive(&mut port, &mut out, fast()).unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(stats.retries, 1);
        // corrupt -> NAK, good -> ACK, duplicate -> ACK, EOT -> ACK
        assert_eq!(port.sent[1..], [vec![NAK], vec![ACK], vec![ACK], vec![ACK]]);
    }

    #[test]
    fn test_receive_falls_back_to_checksum() {
        let mut script = vec![None; CRC_ATTEMPTS as usize];
        script.extend(
            packet(1, b"xyz", Check::Checksum)
                .into_iter()
                .chain([EOT])
                .map(Some),
        );
        let mut port = FakePort::new(&script);
        let mut out = Vec::new();
        receive(&mut port, &mut out, fast()).unwrap();
        assert_eq!(out, b"xyz");
        assert_eq!(port.sent[CRC_ATTEMPTS as usize], vec![NAK]);
    }
}
