//! Command line and scripting surface
//!
//! ```text
//! #Wait 2            sleep
//! #Timeout 10        default wait for #Waitfor / #Send
//! #Prompt router#    prompt awaited after each #Send
//! #Send show ver     mark, send line, wait for the prompt
//! #Waitfor login:    block until text arrives after the mark
//! #Log [file]        start or stop the raw session log
//! #Clear             clear the buffer
//! scp ...            file copy over ssh
//! tun ...            list, open or close tunnels
//! xmodem send|recv f serial file transfer
//! ```
//!
//! Anything else is a plain line: sent to the host while connected,
//! otherwise a connection target.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::transfer::scp::ScpJob;
use crate::transfer::tunnel::TunnelSpec;
use crate::transfer::TransferError;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid duration: {0}")]
    Duration(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmodemDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunCommand {
    List,
    Open(TunnelSpec),
    Close(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Wait(Duration),
    Timeout(Duration),
    Prompt(String),
    Send(String),
    Waitfor(String),
    Log(Option<PathBuf>),
    Clear,
    Scp(ScpJob),
    Tun(TunCommand),
    Xmodem(XmodemDirection, PathBuf),
    Line(String),
}

impl Command {
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let text = text.trim_end_matches(['\r', '\n']);
        let trimmed = text.trim_start();
        let (verb, rest) = match trimmed.split_once(' ') {
            Some((v, r)) => (v, r),
            None => (trimmed, ""),
        };
        let arg = rest.trim();
        let command = match verb.to_ascii_lowercase().as_str() {
            "#wait" => Command::Wait(seconds(arg)?),
            "#timeout" => Command::Timeout(seconds(arg)?),
            "#prompt" => Command::Prompt(arg.to_string()),
            // keep the text as typed, including inner spacing
            "#send" => Command::Send(rest.to_string()),
            "#waitfor" if !arg.is_empty() => Command::Waitfor(arg.to_string()),
            "#waitfor" => return Err(ScriptError::Usage("#Waitfor text")),
            "#log" => Command::Log((!arg.is_empty()).then(|| PathBuf::from(arg))),
            "#clear" => Command::Clear,
            "scp" => Command::Scp(ScpJob::parse(arg)?),
            "tun" => Command::Tun(tun(arg)?),
            "xmodem" => xmodem(arg)?,
            _ => Command::Line(text.to_string()),
        };
        Ok(command)
    }
}

fn seconds(arg: &str) -> Result<Duration, ScriptError> {
    let secs: f64 = arg.parse().map_err(|_| ScriptError::Duration(arg.to_string()))?;
    Duration::try_from_secs_f64(secs).map_err(|_| ScriptError::Duration(arg.to_string()))
}

fn tun(arg: &str) -> Result<TunCommand, ScriptError> {
    const USAGE: &str = "tun | tun close port | tun [L:|R:]spec";
    let mut words = arg.split_whitespace();
    match (words.next(), words.next()) {
        (None, _) => Ok(TunCommand::List),
        (Some(w), Some(port)) if w.eq_ignore_ascii_case("close") => port
            .parse()
            .map(TunCommand::Close)
            .map_err(|_| ScriptError::Usage(USAGE)),
        (Some(spec), None) => Ok(TunCommand::Open(TunnelSpec::parse(spec)?)),
        _ => Err(ScriptError::Usage(USAGE)),
    }
}

fn xmodem(arg: &str) -> Result<Command, ScriptError> {
    const USAGE: &str = "xmodem send|recv file";
    let (dir, path) = arg.split_once(' ').ok_or(ScriptError::Usage(USAGE))?;
    let path = path.trim();
    if path.is_empty() {
        return Err(ScriptError::Usage(USAGE));
    }
    let direction = match dir.to_ascii_lowercase().as_str() {
        "send" | "put" => XmodemDirection::Send,
        "recv" | "receive" | "get" => XmodemDirection::Receive,
        _ => return Err(ScriptError::Usage(USAGE)),
    };
    Ok(Command::Xmodem(direction, PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_commands() {
        assert_eq!(Command::parse("#Wait 2").unwrap(), Command::Wait(Duration::from_secs(2)));
        assert_eq!(
            Command::parse("#TIMEOUT 0.5").unwrap(),
            Command::Timeout(Duration::from_millis(500))
        );
        assert!(matches!(Command::parse("#Wait soon"), Err(ScriptError::Duration(_))));
        assert!(matches!(Command::parse("#Wait -1"), Err(ScriptError::Duration(_))));
        assert!(matches!(Command::parse("#Wait 1e20"), Err(ScriptError::Duration(_))));
        assert!(matches!(Command::parse("#Timeout inf"), Err(ScriptError::Duration(_))));
        assert!(matches!(Command::parse("#Timeout NaN"), Err(ScriptError::Duration(_))));
        assert!(matches!(Command::parse("#Waitfor"), Err(ScriptError::Usage(_))));
    }

    #[test]
    fn test_send_keeps_spacing() {
        assert_eq!(
            Command::parse("#Send show  ip route\r\n").unwrap(),
            Command::Send("show  ip route".into())
        );
        assert_eq!(
            Command::parse("#Prompt router# ").unwrap(),
            Command::Prompt("router#".into())
        );
    }

    #[test]
    fn test_log_toggle() {
        assert_eq!(
            Command::parse("#Log /tmp/session.log").unwrap(),
            Command::Log(Some(PathBuf::from("/tmp/session.log")))
        );
        assert_eq!(Command::parse("#log").unwrap(), Command::Log(None));
    }

    #[test]
    fn test_jobs() {
        assert!(matches!(Command::parse("scp :/etc/hosts .").unwrap(), Command::Scp(_)));
        assert!(matches!(Command::parse("scp a b"), Err(ScriptError::Transfer(_))));
        assert_eq!(Command::parse("tun").unwrap(), Command::Tun(TunCommand::List));
        assert_eq!(
            Command::parse("tun close 8080").unwrap(),
            Command::Tun(TunCommand::Close(8080))
        );
        assert!(matches!(
            Command::parse("tun 8080:web:80").unwrap(),
            Command::Tun(TunCommand::Open(TunnelSpec::Local { bind_port: 8080, .. }))
        ));
        assert_eq!(
            Command::parse("xmodem recv fw.bin").unwrap(),
            Command::Xmodem(XmodemDirection::Receive, PathBuf::from("fw.bin"))
        );
        assert!(Command::parse("xmodem fw.bin").is_err());
    }

    #[test]
    fn test_everything_else_is_a_line() {
        assert_eq!(
            Command::parse("ssh admin@10.0.0.1").unwrap(),
            Command::Line("ssh admin@10.0.0.1".into())
        );
        assert_eq!(Command::parse("").unwrap(), Command::Line(String::new()));
    }
}
