//! Placement Dashboards
//!
//! Role-based dashboards for a teaching placement service: students browse
//! open postings and track their applications, schools review applications
//! to their postings, and education officers follow region-wide counts.
//! Data comes from a hosted Postgres backend (auth, REST rows and a realtime
//! change feed); each mounted dashboard refreshes itself when the
//! `applications` table changes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use placement_dashboards::prelude::*;
//!
//! # async fn run() -> placement_dashboards::error::Result<()> {
//! let config = AppConfig::from_env()?;
//! let backend = Arc::new(SupabaseBackend::new(&config)?);
//! backend.auth().sign_in_with_password("amina@example.com", "secret").await?;
//!
//! let session = DashboardSession::new(backend.clone());
//! if let Route::Dashboard(DashboardKind::Student) = session.start().await? {
//!     let user_id = backend.current_user_id().await?.unwrap_or_default();
//!     let mounted = Mounted::mount(StudentDashboard::new(user_id), backend, config.refresh_policy).await?;
//!     println!("{}", render::student(&mounted.snapshot()));
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod models;
pub mod render;
pub mod role;

pub use placement_auth as auth;
pub use placement_postgrest as postgrest;
pub use placement_realtime as realtime;

/// A convenience module for common imports
pub mod prelude {
    pub use crate::backend::{PlacementBackend, SupabaseBackend};
    pub use crate::config::AppConfig;
    pub use crate::dashboard::{
        Decision, Mounted, OfficerDashboard, RefreshPolicy, SchoolDashboard, StudentDashboard,
    };
    pub use crate::error::{DashboardError, Result};
    pub use crate::render;
    pub use crate::role::{DashboardKind, DashboardSession, Route};
}
