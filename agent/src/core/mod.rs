//! Deterministic, pure logic shared by the assessment loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod gate;
pub mod planning;
pub mod scope;
pub mod types;
