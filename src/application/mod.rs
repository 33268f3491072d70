//! Presence and engagement services over the shared cache.

pub mod engagement;
pub mod error;
pub mod presence;
