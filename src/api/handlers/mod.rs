//! API request handlers

pub mod control;
pub mod health;
