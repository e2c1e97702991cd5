//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod timer;

pub use error::LeaseError;
pub use print::{logger_init, ME};
pub use timer::Timer;
