//! HTTP request handlers

pub mod health;
pub mod keys;
pub mod predict;
pub mod usage;
