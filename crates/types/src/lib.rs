//! Core types and traits for the vkgate workspace.
//!
//! This crate defines the shared abstractions used across all layers of the
//! gateway: the error taxonomy, Credential Store records, routing decisions,
//! remote key service messages, and the async traits each layer implements.

pub mod clock;
pub mod error;
pub mod keyservice;
pub mod model;
pub mod resolution;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{GateError, KeyServiceError, Result};
pub use keyservice::{GenerateKeyRequest, GeneratedKey, KeyInfo, UpdateKeyRequest};
pub use model::{
    ByokProfile, ByokSource, InsertOutcome, KeyStatus, KeyType, ModelSelection, NewByokProfile,
    NewModelSelection, NewProviderCredential, NewSystemProfile, NewVirtualKey, ProfileTest,
    ProfileTestStatus, ProviderCredential, RoutingMode, RoutingOverride, SystemProfile, VirtualKey,
};
pub use resolution::{ByokPayload, PermanentError, Resolution, ResolvedCall, RouteKind};
pub use traits::{CredentialStore, KeyService};
