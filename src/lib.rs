//! Murmur: connection presence and deduplicated visitor engagement over a
//! shared key-value cache.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
