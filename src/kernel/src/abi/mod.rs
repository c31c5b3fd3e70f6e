//! System-wide limits and reserved values shared by every kernel layer.

pub mod constants;

pub use constants::*;
