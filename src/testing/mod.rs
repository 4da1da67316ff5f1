//! Test isolation helpers.

pub mod transaction;

pub use transaction::TestTransaction;
