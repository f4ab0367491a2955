//! Telnet option negotiation
//!
//! Supports the ECHO, SUPPRESS-GO-AHEAD, TERMINAL-TYPE and NEW-ENVIRON
//! subset; everything else is refused.

use std::borrow::Cow;

use crate::core::term::parser::{DO, DONT, IAC, SB, SE, WILL, WONT};

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_TTYPE: u8 = 24;
pub const OPT_NEW_ENVIRON: u8 = 39;

/// TERMINAL-TYPE subnegotiation verbs
const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

/// Who echoes typed characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    Unnegotiated,
    /// Remote side echoes; local echo suppressed
    Remote,
    /// Remote refused to echo; the client echoes
    Local,
}

/// Telnet negotiation state for one connection
#[derive(Debug)]
pub struct Negotiator {
    term_type: String,
    echo: EchoMode,
}

impl Negotiator {
    pub fn new(term_type: &str) -> Self {
        Self {
            term_type: term_type.to_string(),
            echo: EchoMode::Unnegotiated,
        }
    }

    pub fn echo_mode(&self) -> EchoMode {
        self.echo
    }

    /// True once the remote side has taken over echoing
    pub fn echo_suppressed(&self) -> bool {
        self.echo == EchoMode::Remote
    }

    /// Reply to a command: `[verb, option]` or `[SB, option, payload...]`.
    /// Unrecognised commands yield an empty reply.
    pub fn respond(&mut self, command: &[u8]) -> Vec<u8> {
        match command {
            [DO, opt] => {
                if *opt == OPT_ECHO {
                    self.echo = EchoMode::Remote;
                }
                let verb = match *opt {
                    OPT_TTYPE | OPT_NEW_ENVIRON | OPT_ECHO | OPT_SGA => WILL,
                    _ => WONT,
                };
                vec![IAC, verb, *opt]
            }
            [WILL, opt] => {
                if *opt == OPT_ECHO {
                    self.echo = EchoMode::Remote;
                }
                let verb = match *opt {
                    OPT_ECHO | OPT_SGA => DO,
                    _ => DONT,
                };
                vec![IAC, verb, *opt]
            }
            [DONT, opt] | [WONT, opt] => {
                if *opt == OPT_ECHO {
                    self.echo = EchoMode::Local;
                }
                Vec::new()
            }
            [SB, OPT_TTYPE, TTYPE_SEND, ..] => {
                let mut reply = vec![IAC, SB, OPT_TTYPE, TTYPE_IS];
                reply.extend_from_slice(self.term_type.as_bytes());
                reply.extend_from_slice(&[IAC, SE]);
                reply
            }
            _ => Vec::new(),
        }
    }
}

/// Double literal 0xFF bytes in outgoing data
pub fn escape_iac(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.contains(&IAC) {
        return Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len() + 4);
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    Cow::Owned(out)
}
