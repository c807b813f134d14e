//! Persistence for all cryptographic state.
//!
//! The signal store owns identity credentials, pre-keys, sessions,
//! sender keys, device lists and LID mappings; every other component
//! borrows it inside a keyed transaction.

pub mod creds;
pub mod memory;
pub mod signal;
pub mod traits;

pub use creds::Credentials;
pub use memory::MemoryStore;
pub use signal::SignalStore;
pub use traits::{categories, KvBackend, KvWrite, StoreError, StoreResult, INDEX_KEY};
