pub mod accessdb;
pub mod auditdb;
pub mod cache;
pub mod db;
pub mod memory;
pub mod proposaldb;

use self::{accessdb::AccessExt, auditdb::AuditExt, proposaldb::ProposalExt};

/// Everything the services need from persistence. Implemented by the
/// Postgres `DBClient` and by `InMemoryStore`.
pub trait Store: ProposalExt + AccessExt + AuditExt + Send + Sync {
    fn backend(&self) -> &'static str;
}
