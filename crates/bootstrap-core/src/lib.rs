pub mod allocation;
pub mod clock;
pub mod config;
pub mod env;
pub mod error;
pub mod io;
pub mod paths;
pub mod pipeline;
pub mod platform;
pub mod retry;
pub mod secrets;
pub mod sequencer;
pub mod stage;
pub mod summary;
pub mod supervisor;
pub mod wait;

pub use error::{BootstrapError, Result};
