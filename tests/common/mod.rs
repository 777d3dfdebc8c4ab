//! Common test utilities for mediador-crawler integration tests

#[allow(dead_code)]
pub mod fixtures;
#[allow(dead_code)]
pub mod site;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use site::*;
