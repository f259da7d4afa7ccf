/*!
 * Prelude module for Modlink Core.
 *
 * This module re-exports commonly used types and functions from the Modlink
 * Core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Priority, Value};

// Re-export config types
pub use crate::config::{CommConfig, Config, ConfigBuilder, SharedConfig, StoreConfig};

// Re-export utility functions
pub use crate::utils::{millis_to_duration, spawn_and_log, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
