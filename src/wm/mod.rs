//! Pane placement on the host terminal

pub mod pane;

pub use pane::PaneGeometry;
