//! Database module for statusboard.
//!
//! Target registry and history log in SQLite, with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
