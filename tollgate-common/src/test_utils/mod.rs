//! Utilities used in both this crate's unit tests and downstream crates'
//! tests (via the `test-utils` feature).

pub mod arbitrary;
pub mod roundtrip;
