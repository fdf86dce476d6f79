pub mod cache;
pub mod clob_api;
pub mod types;
