pub mod access;
pub mod portal;
pub mod proposals;
pub mod webhooks;
