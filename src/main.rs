//! tterm - a terminal client for serial lines, telnet, SSH and local processes
//!
//! # Quick Start
//!
//! ```text
//! tterm                         # start idle, type a target at the prompt
//! tterm ssh admin@10.0.0.1      # connect straight away
//! tterm serial /dev/ttyUSB0:115200
//! tterm --script deploy.txt router1
//! ```
//!
//! # Keys
//!
//! | Key | Action |
//! |-----|--------|
//! | Ctrl+] | Command prompt (targets, `#Send`, `scp`, `tun`, ...) |
//! | Shift+PageUp/PageDown | Scroll through history |
//! | Ctrl+Q | Quit |

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::SetTitle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tterm::config::{data_dir, Config};
use tterm::core::engine::{Engine, EngineEvent};
use tterm::history::CommandHistory;
use tterm::ui::{local_action, map_key, paste, LocalAction, Renderer};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shown in front of the command line
const PROMPT: &str = "tterm> ";

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Options {
    target: Option<String>,
    script: Option<PathBuf>,
}

fn print_help() {
    eprintln!("tterm {} - terminal client for serial, telnet, SSH and pipes", VERSION);
    eprintln!();
    eprintln!("Usage: tterm [OPTIONS] [TARGET]");
    eprintln!();
    eprintln!("Targets:");
    eprintln!("  ssh [user[:password]@]host[:port]");
    eprintln!("  sftp [user@]host[:port]");
    eprintln!("  netconf [user@]host[:port]     (port 830 by default)");
    eprintln!("  telnet host[:port]");
    eprintln!("  serial <port>[:baud[,parity,data,stop]]");
    eprintln!("  pipe <command line>");
    eprintln!("  host                           (same as ssh host)");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --script <FILE>   Run command lines from FILE after connecting");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keys:");
    eprintln!("  Ctrl+]                Command prompt");
    eprintln!("  Shift+PageUp/Down     Scroll history");
    eprintln!("  Ctrl+Q                Quit");
}

/// `None` means the process should exit after printing help or version
fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut options = Options::default();
    let mut words = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                eprintln!("tterm {}", VERSION);
                return Ok(None);
            }
            "-s" | "--script" => {
                i += 1;
                let file = args.get(i).ok_or("Missing script file")?;
                options.script = Some(PathBuf::from(file));
            }
            arg if arg.starts_with('-') && words.is_empty() => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            // the rest is the target, spaces included (`pipe ls -l`)
            _ => {
                words.extend_from_slice(&args[i..]);
                break;
            }
        }
        i += 1;
    }
    if !words.is_empty() {
        options.target = Some(words.join(" "));
    }
    Ok(Some(options))
}

/// Log to `~/.tterm/tterm.log`; the console belongs to the session
fn init_logging(config: &Config) {
    let log_path = data_dir()
        .map(|d| d.join("tterm.log"))
        .unwrap_or_else(|| PathBuf::from("tterm.log"));

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => return Ok(()),
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let config = Config::load();
    init_logging(&config);
    info!("tterm {} starting", VERSION);

    let script = match &options.script {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("cannot read script {}", path.display()))?,
        ),
        None => None,
    };

    let (cols, rows) = Renderer::size().unwrap_or((config.cols, config.rows));
    let mut settings = config.settings();
    settings.cols = cols;
    settings.rows = rows;
    let (engine, events) = Engine::new(settings, config.wait_timeout());
    let mut history = CommandHistory::new();

    let mut renderer = Renderer::new();
    renderer.init()?;

    let mut app = App {
        engine,
        history: &mut history,
        prompt: None,
        dirty: true,
    };
    match &options.target {
        Some(target) => {
            app.history.add(target);
            app.run_command(target.clone());
        }
        None => app.open_prompt(),
    }
    if let Some(script) = script {
        app.run_script(script);
    }

    let result = app.main_loop(&mut renderer, &events);

    app.engine.disconnect();
    let _ = renderer.cleanup();
    info!("tterm exiting");
    result
}

/// The one-line command prompt
struct Prompt {
    line: String,
}

struct App<'a> {
    engine: Arc<Engine>,
    history: &'a mut CommandHistory,
    prompt: Option<Prompt>,
    dirty: bool,
}

impl App<'_> {
    fn main_loop(&mut self, renderer: &mut Renderer, events: &Receiver<EngineEvent>) -> anyhow::Result<()> {
        let poll_timeout = Duration::from_millis(20);

        loop {
            loop {
                match events.try_recv() {
                    Ok(event) => self.on_engine_event(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            if self.dirty {
                self.dirty = false;
                let status = self.prompt.as_ref().map(|p| format!("{}{}", PROMPT, p.line));
                self.engine
                    .with_terminal(|term| renderer.render(&term.buffer, status.as_deref()))?;
            }

            if !event::poll(poll_timeout)? {
                continue;
            }
            match event::read()? {
                Event::Key(key) => {
                    if key.kind == KeyEventKind::Release {
                        continue;
                    }
                    if self.prompt.is_some() {
                        self.prompt_key(&key);
                        continue;
                    }
                    match local_action(&key) {
                        Some(LocalAction::Quit) => {
                            info!("quit requested");
                            return Ok(());
                        }
                        Some(LocalAction::CommandPrompt) => self.open_prompt(),
                        Some(LocalAction::ScrollPage(dir)) => {
                            let page = self.engine.with_terminal(|t| t.buffer.rows()) as isize;
                            self.engine.scroll(dir * (page - 1).max(1));
                        }
                        Some(LocalAction::ScrollLine(dir)) => self.engine.scroll(dir),
                        None => {
                            let modes = self.engine.with_terminal(|t| {
                                let top = t.buffer.screen_top() as isize;
                                t.buffer.scroll_view(top);
                                t.buffer.modes.clone()
                            });
                            if let Some(bytes) = map_key(&key, &modes) {
                                self.engine.write(&bytes);
                            }
                        }
                    }
                }
                Event::Paste(text) => {
                    if let Some(prompt) = &mut self.prompt {
                        prompt.line.push_str(text.lines().next().unwrap_or(""));
                        self.dirty = true;
                    } else {
                        let modes = self.engine.with_terminal(|t| t.buffer.modes.clone());
                        self.engine.write(&paste(&text, &modes));
                    }
                }
                Event::Resize(cols, rows) => {
                    self.engine.resize(cols, rows);
                    self.dirty = true;
                }
                _ => {}
            }
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Redraw => self.dirty = true,
            EngineEvent::Title(title) => {
                let _ = execute!(io::stdout(), SetTitle(&title));
            }
            EngineEvent::Bell => {
                let mut stdout = io::stdout();
                let _ = stdout.write_all(b"\x07");
                let _ = stdout.flush();
            }
            EngineEvent::Connected(name) => {
                let _ = execute!(io::stdout(), SetTitle(format!("tterm - {}", name)));
                self.dirty = true;
            }
            EngineEvent::Disconnected(_) => {
                let _ = execute!(io::stdout(), SetTitle("tterm"));
                self.dirty = true;
            }
        }
    }

    fn open_prompt(&mut self) {
        self.prompt = Some(Prompt { line: String::new() });
        self.dirty = true;
    }

    fn prompt_key(&mut self, key: &KeyEvent) {
        let Some(prompt) = &mut self.prompt else {
            return;
        };
        self.dirty = true;
        match key.code {
            KeyCode::Enter => {
                let line = std::mem::take(&mut prompt.line);
                self.prompt = None;
                if !line.trim().is_empty() {
                    self.history.add(&line);
                    self.run_command(line);
                }
            }
            KeyCode::Esc => self.prompt = None,
            KeyCode::Backspace => {
                prompt.line.pop();
            }
            KeyCode::Char(c) if !c.is_control() => prompt.line.push(c),
            _ => {}
        }
    }

    /// Commands can block (`#Waitfor`, `#Send`), so they run off the UI thread
    fn run_command(&self, line: String) {
        let engine = self.engine.clone();
        let spawned = thread::Builder::new().name("command".into()).spawn(move || {
            if let Err(e) = engine.command(&line) {
                engine.print(&format!("{}\n", e));
            }
        });
        if let Err(e) = spawned {
            error!("could not start command thread: {}", e);
        }
    }

    /// Lines run in order; the first failure stops the script
    fn run_script(&self, script: String) {
        let engine = self.engine.clone();
        let spawned = thread::Builder::new().name("script".into()).spawn(move || {
            for line in script.lines() {
                let line = line.trim_end();
                if line.is_empty() || line.starts_with("//") {
                    continue;
                }
                if let Err(e) = engine.command(line) {
                    engine.print(&format!("script stopped at \"{}\": {}\n", line, e));
                    return;
                }
            }
        });
        if let Err(e) = spawned {
            error!("could not start script thread: {}", e);
        }
    }
}
