//! Mailgate Common - Shared types and utilities
//!
//! This crate provides configuration, the storage-facing error type,
//! identifiers and the email address parser shared by all Mailgate crates.

pub mod address;
pub mod config;
pub mod error;
pub mod types;

pub use address::{Address, AddressError};
pub use config::Config;
pub use error::{Error, Result};
