//! Parley server-side crypto helpers.
//!
//! The server never handles message encryption; the only crypto it performs
//! is authenticating inbound account-lifecycle webhooks.

pub mod signature;

pub use signature::{SignatureError, SignedHeaders, WebhookVerifier};
