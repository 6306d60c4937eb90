//! Error handling for the placement dashboards

use std::fmt;
use thiserror::Error;

use crate::models::RoleParseError;

/// Unified error type for the dashboards crate
#[derive(Error, Debug)]
pub enum DashboardError {
    /// Sign-in, sign-out and session errors
    #[error("Authentication error: {0}")]
    Auth(#[from] placement_auth::AuthError),

    /// Row queries, counts and writes
    #[error("Database error: {0}")]
    Database(#[from] placement_postgrest::PostgrestError),

    /// Change feed errors
    #[error("Realtime error: {0}")]
    Realtime(#[from] placement_realtime::RealtimeError),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation needed a signed-in user
    #[error("No active session")]
    MissingSession,

    #[error(transparent)]
    Role(#[from] RoleParseError),

    /// A required row (student, school or officer record) does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl DashboardError {
    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        DashboardError::Config(msg.to_string())
    }

    pub fn not_found<T: fmt::Display>(what: T) -> Self {
        DashboardError::NotFound(what.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DashboardError>;
