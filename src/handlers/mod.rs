pub mod config;
pub mod jobs;
pub mod transcribe;
pub mod upload;

pub use config::*;
pub use jobs::*;
pub use transcribe::*;
