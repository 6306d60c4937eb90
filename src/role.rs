//! Role resolution and page routing
//!
//! A signed-in identity is mapped to one of three dashboards through the
//! `role` column of its profile. The session driver follows auth-state
//! changes and keeps the current [`Route`] on a watch channel.

use placement_auth::AuthChangeEvent;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::backend::PlacementBackend;
use crate::error::Result;
use crate::models::UserRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardKind {
    Student,
    School,
    Officer,
    /// Missing or unrecognised role, or the lookup failed
    Unavailable,
}

impl DashboardKind {
    pub fn for_role(role: Option<UserRole>) -> Self {
        match role {
            Some(UserRole::Student) => DashboardKind::Student,
            Some(UserRole::SchoolAdmin) => DashboardKind::School,
            Some(UserRole::EducationOfficer) => DashboardKind::Officer,
            None => DashboardKind::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Public entry page
    Landing,
    /// Sign-in screen
    Auth,
    Dashboard(DashboardKind),
}

/// Look up the role on the user's profile. `Ok(None)` means no profile row;
/// a role value outside the known set is an error.
pub async fn resolve_role(backend: &dyn PlacementBackend, user_id: &str) -> Result<Option<UserRole>> {
    match backend.role_of(user_id).await? {
        Some(raw) => Ok(Some(raw.parse::<UserRole>()?)),
        None => Ok(None),
    }
}

/// Resolve the dashboard for a user. Failures are logged and produce the
/// fallback view; there is no retry.
pub async fn dashboard_for(backend: &dyn PlacementBackend, user_id: &str) -> DashboardKind {
    match resolve_role(backend, user_id).await {
        Ok(role) => {
            let kind = DashboardKind::for_role(role);
            info!(%user_id, ?role, ?kind, "resolved dashboard");
            kind
        }
        Err(e) => {
            error!(%user_id, "error fetching role: {}", e);
            DashboardKind::Unavailable
        }
    }
}

/// Follows the session and decides which page to show
pub struct DashboardSession {
    backend: Arc<dyn PlacementBackend>,
    route: watch::Sender<Route>,
}

impl DashboardSession {
    pub fn new(backend: Arc<dyn PlacementBackend>) -> Self {
        let (route, _) = watch::channel(Route::Landing);
        Self { backend, route }
    }

    pub fn route(&self) -> Route {
        *self.route.borrow()
    }

    /// Route updates, starting with the current one
    pub fn routes(&self) -> watch::Receiver<Route> {
        self.route.subscribe()
    }

    fn set_route(&self, route: Route) -> Route {
        debug!(?route, "route");
        self.route.send_replace(route);
        route
    }

    /// Initial routing: the sign-in screen without a session, otherwise the
    /// user's dashboard
    pub async fn start(&self) -> Result<Route> {
        let route = match self.backend.current_user_id().await? {
            None => Route::Auth,
            Some(user_id) => Route::Dashboard(dashboard_for(self.backend.as_ref(), &user_id).await),
        };
        Ok(self.set_route(route))
    }

    /// Apply one auth-state change. Returns the new route when it changed
    /// because of this event.
    pub async fn handle_auth_event(&self, event: AuthChangeEvent) -> Option<Route> {
        match event {
            AuthChangeEvent::SignedOut => Some(self.set_route(Route::Auth)),
            AuthChangeEvent::SignedIn(session) => {
                let kind = dashboard_for(self.backend.as_ref(), &session.user.id).await;
                Some(self.set_route(Route::Dashboard(kind)))
            }
            AuthChangeEvent::TokenRefreshed(_) => None,
        }
    }

    /// Process auth-state changes until the stream closes
    pub async fn run(&self, mut events: broadcast::Receiver<AuthChangeEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.handle_auth_event(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "auth events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Sign out and go to the landing page. The local session is gone even if
    /// the server call fails. The `SignedOut` event that follows moves a
    /// running session on to the sign-in screen.
    pub async fn sign_out(&self) -> Route {
        // Routed first so the SignedOut event lands after it.
        self.set_route(Route::Landing);
        if let Err(e) = self.backend.sign_out().await {
            warn!("sign-out was not confirmed by the server: {}", e);
        }
        Route::Landing
    }
}
