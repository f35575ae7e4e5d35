//! Secret handling utilities.
//!
//! Re-exports secrecy types and helpers for keeping credentials such as
//! the database URL and webhook endpoint out of logs and `Debug` output.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Render a secret URL for logs: scheme and host only.
///
/// `https://user:pw@hooks.example.com/T000/B000/XXXX` becomes
/// `https://hooks.example.com/…`. Anything unparseable is fully masked.
pub fn redacted_url(secret: &SecretString) -> String {
    let raw = secret.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    if host.is_empty() {
        return "***".to_string();
    }
    format!("{scheme}://{host}/…")
}
