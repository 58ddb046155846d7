//! BYOK access policy routing for vkgate.
//!
//! [`PolicyRouter::resolve`] turns a `(scope, caller)` pair into a
//! [`vkgate_types::Resolution`]: a ready call descriptor, a pending marker
//! while the caller's virtual key is provisioned, or a permanent rejection.

mod router;
pub mod tags;

pub use router::PolicyRouter;
