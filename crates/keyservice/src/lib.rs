//! Remote Key Service Adapter.
//!
//! [`HttpKeyService`] speaks the LiteLLM-style admin API of the downstream
//! proxy; [`InMemoryKeyService`] is a scriptable stand-in for tests and
//! offline runs.

pub mod http;
pub mod memory;

pub use http::HttpKeyService;
pub use memory::InMemoryKeyService;
