//! Services layer for identity-service.
//!
//! The tenant store is authoritative; the revocation cache, audit emitter
//! and background queue are accelerators or side channels whose failures are
//! absorbed here rather than surfaced to callers.

pub mod audit;
pub mod background;
pub mod cache;
pub mod credentials;
mod database;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod lockout;
pub mod metrics;
pub mod sessions;

pub use audit::{
    select_audit_emitter, AuditEmitter, AuditRecorder, LogAuditEmitter, MemoryAuditEmitter,
    NoopAuditEmitter, RedisStreamAuditEmitter,
};
pub use background::{
    BackgroundJob, BackgroundQueue, LogOnlySecretStore, MemorySealedSecretStore, SealedSecretStore,
};
pub use cache::{CacheBackend, CacheError, MemoryCache, NoopCache, RedisCache};
pub use credentials::{
    CredentialService, IssueApiKeyRequest, IssuedApiKey, RotateApiKeyRequest, RotatedCredential,
};
pub use database::{Database, RotatedApiKey, TenantTx};
pub use directory::DirectoryService;
pub use envelope::{AesGcmEnvelope, PassthroughEnvelope, SealedSecret, SecretEnvelope};
pub use error::ServiceError;
pub use lockout::{FailureOutcome, LockoutTracker};
pub use sessions::{CreateSessionRequest, SessionService};
