pub mod core;
pub mod run;
pub mod schema;
pub mod vote;

pub use core::Database;
