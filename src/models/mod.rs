pub mod accessmodel;
pub mod auditmodel;
pub mod proposalmodel;
