//! Console front end.
//!
//! - **renderer**: draws the visible rows of the screen buffer
//! - **keymapper**: key events to host byte sequences, plus client-side keys

pub mod keymapper;
pub mod renderer;

pub use keymapper::{local_action, map_key, paste, LocalAction};
pub use renderer::Renderer;
