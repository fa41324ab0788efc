pub mod engine;

pub use engine::{ExecutionEngine, USER_AGENT};
