//! Lookup Collaborators
//!
//! File and environment backed implementations of the lookup ports:
//! - [`StaticTokenValidator`]: fixed token to user table
//! - [`SymbolMaster`]: CSV symbol mapping
//! - [`EnvCredentialStore`]: provider credentials from the environment

mod credentials;
mod symbols;
mod tokens;

pub use credentials::EnvCredentialStore;
pub use symbols::SymbolMaster;
pub use tokens::StaticTokenValidator;
