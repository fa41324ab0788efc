pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use store::RegistryStore;
pub use types::{
    Command, CommandDraft, CommandType, Entity, ExecutionInfo, ExecutionMode, ExecutionStatus,
    ModuleResponseDraft, ModuleResponseRow, ResponseAction, TriggerType,
};
