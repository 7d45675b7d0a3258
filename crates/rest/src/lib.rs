//! Executes REST-level read queries: ACL resolution, subquery substitution,
//! include expansion, and post-read triggers, on top of a storage backend.

pub mod auth;
pub mod backend;
pub mod include;
pub mod query;
pub mod triggers;

pub use auth::Auth;
pub use backend::Backend;
pub use query::{FindOptions, FindResponse, RestQuery};
pub use triggers::AfterFind;
