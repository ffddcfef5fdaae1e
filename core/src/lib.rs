pub mod config;
pub mod diagnostics;
pub mod dimension;
pub mod engine;
pub mod error;
pub mod event;
pub mod export;
pub mod facts;
pub mod group;
pub mod identity;
pub mod ingest;
pub mod overrides;
pub mod stats;
pub mod store;
pub mod text;
pub mod trends;
pub mod types;
