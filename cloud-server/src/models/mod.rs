//! Data models

pub mod alert;
pub mod envelope;

pub use alert::*;
pub use envelope::*;
