//! Authentication for the legacy symmetric-key connection path
//!
//! Certificate-based authentication is handled entirely by the transport;
//! this module only covers the shared-access-signature tokens used when a
//! device connects with a base64 device key instead of an X.509 identity.

pub mod sas;

pub use sas::{generate, SasTokenConfig, TokenError};
