// HTTP API routes
//
// Each submodule handles one resource with its own AppState.

pub mod actions;
pub mod common;
pub mod events;
pub mod updates;

// Re-export common types
pub use common::{ErrorResponse, ListResponse, Viewer};
