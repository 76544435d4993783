//! Repository implementations for database operations

pub mod rounds;
pub mod signals;

pub use rounds::*;
pub use signals::*;
