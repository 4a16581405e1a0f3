//! Ember - semantic core of a small systems language compiler
//!
//! Takes an already-parsed tree (see `frontend::syntax`), resolves names,
//! checks types and lowers the result into a compact IR.

pub mod driver;
pub mod feedback;
pub mod frontend;
pub mod middle;
pub mod types;
pub mod utils;

pub use driver::{Options, Session};
