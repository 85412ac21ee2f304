//! Test utilities

pub mod mocks;
