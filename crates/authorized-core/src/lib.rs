//! Core abstractions for authorized: user records and the provider contract
//! that feeds them to the key directory manager.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod provider;
pub mod user;
