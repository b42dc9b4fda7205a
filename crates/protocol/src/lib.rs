pub mod config;
pub mod envelope;

pub use config::*;
pub use envelope::*;
