//! Integration test crate for the Keeper engine.
//!
//! This crate has no library code. Its tests wire several keepers together
//! over an in-process network and drive challenge, repair and settlement
//! end to end.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p keeper-integration-tests
//! ```
