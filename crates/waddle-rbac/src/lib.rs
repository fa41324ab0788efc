pub mod db;
pub mod error;
pub mod service;
pub mod types;

pub use service::RbacService;
pub use types::{Role, RoleScope, GLOBAL_COMMUNITY_ID};
