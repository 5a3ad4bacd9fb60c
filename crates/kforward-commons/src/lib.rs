pub mod config_loader;
pub mod error;
pub mod logging;
pub mod models;

pub use error::{Error, PortConflict, Result};
pub use models::*;
