pub mod assembler;
pub mod combiner;
pub mod config;
pub mod domain;
pub mod error;
pub mod metadata;
pub mod output;
pub mod retry;
pub mod store;
pub mod tracker;
