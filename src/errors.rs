//! Error types for the resolver.
//!
//! This module defines the error types used throughout the resolver implementation.

use thiserror::Error;

/// Represents errors that can occur in the resolver.
#[derive(Error, Debug)]
pub enum DnsError {
    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors related to DNS protocol parsing or formatting.
    #[error("Invalid DNS packet: {0}")]
    Protocol(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),
}
