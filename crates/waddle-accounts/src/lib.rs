pub mod db;
pub mod error;
pub mod manager;
pub mod types;

pub use manager::{hash_api_key, AccountStore};
pub use types::{AccountType, ServiceAccount, UsageRecord};
