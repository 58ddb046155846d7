//! Encryption at rest for secrets held in the credential store.
//!
//! [`TokenCipher`] protects virtual key tokens and BYOK provider keys; the
//! master key never touches disk and plaintext only leaves as a
//! [`secrecy::SecretString`].

pub mod cipher;

pub use cipher::{CipherError, TokenCipher};
