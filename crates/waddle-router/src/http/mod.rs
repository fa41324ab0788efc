pub mod admin;
pub mod coordination;
pub mod events;
pub mod ops;
pub mod registry_api;
pub mod responses;
pub mod rules;
