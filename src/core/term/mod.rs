//! Escape sequence scanning and pane translation

pub mod parser;
pub mod translator;

pub use parser::{ControlSequence, Event, Scanner};
pub use translator::Translator;
