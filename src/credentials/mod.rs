//! Credential acquisition: durable cache, providers, and the resolver that
//! composes them

pub mod cache;
pub mod clock;
pub mod provider;
pub mod resolver;
pub mod sas;

pub use cache::{CacheError, ConfigCache, FileConfigCache, InMemoryConfigCache};
pub use clock::{Clock, SystemClock};
pub use provider::{ConfigProvider, FetchError, HttpConfigProvider, SharedKeyProvider};
pub use resolver::{CredentialResolver, ResolveError};
pub use sas::{generate_sas_token, SasError};
