//! Command model.
//!
//! This module provides the immutable [`Command`] builder, its validation
//! rules and an explicit [`CommandRegistry`] that maps names to
//! constructors for concrete command wrappers.
//!
//! # Example
//!
//! ```
//! use cmdchain::command::{Command, CommandRegistry};
//!
//! fn disk_free() -> Command {
//!     Command::new("df").with_option("-h")
//! }
//!
//! let registry = CommandRegistry::new().with("df", disk_free).unwrap();
//! let cmd = registry.create("df").unwrap().add_arg("/");
//! assert_eq!(cmd.command_line(), "df -h /");
//! ```

mod builder;
mod registry;
mod validation;

pub use builder::{join_tokens, shell_quote, Command, ParamValue, SUDO};
pub use registry::{CommandConstructor, CommandRegistry};
pub use validation::Violation;
