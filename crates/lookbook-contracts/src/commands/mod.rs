//! Line-oriented command language for the interactive editor.

mod command_registry;
mod parser;

pub use command_registry::EDITOR_HELP_COMMANDS;
pub use parser::{parse_command, EditorCommand};
