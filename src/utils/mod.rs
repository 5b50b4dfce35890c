// src/utils/mod.rs
pub mod error;
pub mod logging;
pub mod html_debug;

pub use error::{AppError, ErrorKind, ExtractError, NavigationError, StorageError}; // Re-export for convenience
