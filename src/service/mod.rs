pub mod access_service;
pub mod audit_service;
pub mod deposit_service;
pub mod document_service;
pub mod effects;
pub mod error;
pub mod otp_service;
pub mod payment_provider;
pub mod portal_service;
pub mod proposal_service;
pub mod status_flow;
pub mod tier_pricing;
