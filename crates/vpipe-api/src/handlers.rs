//! Request handlers.

pub mod health;
pub mod progress;
pub mod uploads;

pub use health::*;
pub use progress::*;
pub use uploads::*;
