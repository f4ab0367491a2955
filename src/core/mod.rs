//! Core terminal client components.
//!
//! - **term**: screen buffer and escape interpreter
//! - **engine**: ties a transport to a terminal and runs commands
//! - **script**: command line / scripting surface parser
//!
//! # Architecture
//!
//! ```text
//! Engine
//! ├── Transport (reader thread, Event callbacks)
//! ├── Terminal
//! │   ├── ScreenBuffer (text + attributes + line table)
//! │   └── EscapeInterpreter
//! └── script state (#Timeout, #Prompt, #Log)
//! ```

pub mod engine;
pub mod script;
pub mod term;
