//! Identity Service - tenant-isolated identities, API keys and sessions.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod startup;
