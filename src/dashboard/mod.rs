//! Role dashboards and their realtime lifecycle
//!
//! Each variant loads its rows concurrently into a snapshot. [`Mounted`] keeps
//! a snapshot current from the `applications` change feed and publishes every
//! new version on a watch channel until it is unmounted.

pub mod officer;
pub mod school;
pub mod student;

pub use officer::{OfficerCounts, OfficerDashboard, OfficerSnapshot};
pub use school::{Decision, SchoolDashboard, SchoolSnapshot};
pub use student::{StudentDashboard, StudentSnapshot};

use async_trait::async_trait;
use placement_realtime::Change;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::PlacementBackend;
use crate::cache::CacheOutcome;
use crate::error::{DashboardError, Result};
use crate::models::Notification;

/// Open postings shown to students
pub const OPEN_POSTING_LIMIT: usize = 6;

/// Applications listed on the school dashboard
pub const RECENT_APPLICATION_LIMIT: usize = 5;

/// How a mounted dashboard reacts to a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Reload everything once per notification
    #[default]
    Refetch,
    /// Patch cached rows when possible, reload otherwise
    Incremental,
}

impl FromStr for RefreshPolicy {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "refetch" => Ok(RefreshPolicy::Refetch),
            "incremental" => Ok(RefreshPolicy::Incremental),
            other => Err(DashboardError::config(format!(
                "unknown refresh policy '{}', expected refetch or incremental",
                other
            ))),
        }
    }
}

impl fmt::Display for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshPolicy::Refetch => f.write_str("refetch"),
            RefreshPolicy::Incremental => f.write_str("incremental"),
        }
    }
}

/// One labelled figure on a dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub label: &'static str,
    pub value: u64,
}

impl Stat {
    pub fn new(label: &'static str, value: u64) -> Self {
        Self { label, value }
    }
}

/// A dashboard variant
#[async_trait]
pub trait Dashboard: Send + Sync + 'static {
    type Snapshot: Clone + Send + Sync + 'static;

    /// Realtime channel name
    fn channel(&self) -> &'static str;

    /// Fetch everything the view shows. A fetch that fails keeps the value
    /// from `previous` (or an empty one) and is only logged.
    async fn load(
        &self,
        backend: &dyn PlacementBackend,
        previous: Option<&Self::Snapshot>,
    ) -> Self::Snapshot;

    /// Try to apply a change without reloading
    fn apply_change(&self, _snapshot: &mut Self::Snapshot, _change: &Change) -> CacheOutcome {
        CacheOutcome::NeedsRefetch
    }
}

/// Unread notifications for a user, newest first
pub async fn unread_notifications(
    backend: &dyn PlacementBackend,
    user_id: &str,
) -> Result<Vec<Notification>> {
    backend.unread_notifications(user_id).await
}

/// A dashboard kept live from the change feed. Dropping it stops the refresh
/// task and leaves the realtime channel.
pub struct Mounted<D: Dashboard> {
    dashboard: Arc<D>,
    snapshots: watch::Receiver<D::Snapshot>,
    refreshes: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl<D: Dashboard> Mounted<D> {
    /// Subscribe, load, publish, and start following changes. The feed is
    /// open before the first load, so a change committed during that load
    /// still triggers a refresh.
    pub async fn mount(
        dashboard: D,
        backend: Arc<dyn PlacementBackend>,
        policy: RefreshPolicy,
    ) -> Result<Self> {
        let dashboard = Arc::new(dashboard);
        let mut feed = backend.subscribe_applications(dashboard.channel()).await?;

        let initial = dashboard.load(backend.as_ref(), None).await;
        let (publisher, snapshots) = watch::channel(initial);
        info!(channel = dashboard.channel(), %policy, "dashboard mounted");

        let refreshes = Arc::new(AtomicUsize::new(0));
        let task = {
            let dashboard = dashboard.clone();
            let refreshes = refreshes.clone();
            tokio::spawn(async move {
                while let Some(change) = feed.recv().await {
                    debug!(kind = ?change.kind, row = ?change.row_id(), "application change");

                    if policy == RefreshPolicy::Incremental {
                        let mut patched = publisher.borrow().clone();
                        match dashboard.apply_change(&mut patched, &change) {
                            CacheOutcome::Applied => {
                                publisher.send_replace(patched);
                                continue;
                            }
                            CacheOutcome::Ignored => continue,
                            CacheOutcome::NeedsRefetch => {}
                        }
                    }

                    let previous = publisher.borrow().clone();
                    let fresh = dashboard.load(backend.as_ref(), Some(&previous)).await;
                    refreshes.fetch_add(1, Ordering::SeqCst);
                    publisher.send_replace(fresh);
                }
                warn!(
                    channel = dashboard.channel(),
                    "change feed closed, dashboard no longer refreshes"
                );
            })
        };

        Ok(Self {
            dashboard,
            snapshots,
            refreshes,
            task,
        })
    }

    pub fn dashboard(&self) -> &D {
        &self.dashboard
    }

    /// The latest published snapshot
    pub fn snapshot(&self) -> D::Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver for every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<D::Snapshot> {
        self.snapshots.clone()
    }

    /// Full reloads triggered by change notifications
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn unmount(self) {}
}

impl<D: Dashboard> Drop for Mounted<D> {
    fn drop(&mut self) {
        self.task.abort();
        info!(channel = self.dashboard.channel(), "dashboard unmounted");
    }
}
