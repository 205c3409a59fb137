//! Shared models and utilities used across feature modules.

pub mod models;
