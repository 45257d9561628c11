//! Persistence for users, roles and the verification bookkeeping.
//!
//! [`CredentialStore`] is the transactional seam; [`DbOperations`] backs it
//! with PostgreSQL and [`MemoryStore`] keeps everything in process.

pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub use memory::MemoryStore;
pub use models::{NewUser, Role, User, UserResponse, VerificationCode, VerificationIssue};
pub use operations::DbOperations;
pub use store::CredentialStore;
