pub mod connection;
pub mod tokens;

pub use connection::*;
pub use tokens::{DatabaseTokenStore, spawn_sweeper};
