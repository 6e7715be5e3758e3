//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below drives a full [`aptlink::Link`] (real reader and writer
//! threads) against the in-process simulated motherboard. No hardware
//! required.

mod efs_tests;
mod harness;
mod link_tests;
mod system_tests;
