// Output module - errors and terminal reporting

pub mod errors;
pub mod terminal;

pub use errors::{ArmadaError, ModuleError, ParseError, ParseErrorKind, TemplateErrorKind};
pub use terminal::{HostRecap, Logger};
