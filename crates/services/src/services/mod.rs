pub mod config;
pub mod data_source;
pub mod form;
pub mod permissions;
pub mod persistence;
pub mod reorder;
