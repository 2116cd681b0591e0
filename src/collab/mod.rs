//! Interfaces to the collaborators the pipeline consumes but does not own.
//!
//! - [`Cache`] - key-value memo store for API responses
//! - [`ScriptHook`] - user script consulted for skip and naming decisions
//! - [`Decrypter`] - opaque protected-content decrypt operation

mod cache;
mod decrypt;
mod script;

pub use cache::{Cache, CacheError, MemoryCache, NoopCache};
pub use decrypt::{BoxError, Decrypted, Decrypter};
pub use script::{CommandHook, HookContext, HookError, ScriptHook, is_skip_output};
