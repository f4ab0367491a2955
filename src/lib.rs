//! tterm: a terminal client for serial lines, telnet, SSH and local processes.

pub mod config;
pub mod core;
pub mod history;
pub mod transfer;
pub mod transport;
pub mod ui;
pub mod util;
