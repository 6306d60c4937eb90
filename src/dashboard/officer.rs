use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{error, info};

use super::{Dashboard, Stat};
use crate::backend::{CountQuery, PlacementBackend};
use crate::error::{DashboardError, Result};
use crate::models::{Application, ApplicationStatus, Profile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfficerCounts {
    pub students: u64,
    pub schools: u64,
    pub applications: u64,
    pub pending_approvals: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfficerSnapshot {
    pub profile: Option<Profile>,
    pub counts: OfficerCounts,
    /// Applications per status, in [`ApplicationStatus::ALL`] order
    pub status_breakdown: Vec<(ApplicationStatus, u64)>,
}

impl OfficerSnapshot {
    /// Active Students, Partner Schools, Total Placements, Pending Approvals
    pub fn stats(&self) -> Vec<Stat> {
        vec![
            Stat::new("Active Students", self.counts.students),
            Stat::new("Partner Schools", self.counts.schools),
            Stat::new("Total Placements", self.counts.applications),
            Stat::new("Pending Approvals", self.counts.pending_approvals),
        ]
    }
}

/// Region-wide counts; there are no cached rows, so every change recounts
#[derive(Debug, Clone)]
pub struct OfficerDashboard {
    user_id: String,
}

fn keep_or_log(result: Result<u64>, previous: u64, what: CountQuery) -> u64 {
    match result {
        Ok(count) => count,
        Err(e) => {
            error!(query = ?what, "error counting rows: {}", e);
            previous
        }
    }
}

impl OfficerDashboard {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Officer approval of an application
    pub async fn approve(
        &self,
        backend: &dyn PlacementBackend,
        application_id: &str,
    ) -> Result<Application> {
        let officer_id = backend
            .officer_id_for(&self.user_id)
            .await?
            .ok_or_else(|| DashboardError::not_found(format!("officer record for {}", self.user_id)))?;

        let application = backend.approve_application(application_id, &officer_id).await?;
        info!(%application_id, %officer_id, "application approved by officer");
        Ok(application)
    }
}

#[async_trait]
impl Dashboard for OfficerDashboard {
    type Snapshot = OfficerSnapshot;

    fn channel(&self) -> &'static str {
        "officer-applications"
    }

    async fn load(
        &self,
        backend: &dyn PlacementBackend,
        previous: Option<&OfficerSnapshot>,
    ) -> OfficerSnapshot {
        let (profile, students, schools, applications, pending, breakdown) = tokio::join!(
            backend.profile(&self.user_id),
            backend.count(CountQuery::Students),
            backend.count(CountQuery::Schools),
            backend.count(CountQuery::Applications),
            backend.count(CountQuery::PendingOfficerApproval),
            join_all(
                ApplicationStatus::ALL
                    .iter()
                    .map(|status| backend.count(CountQuery::ApplicationsWithStatus(*status)))
            ),
        );

        let mut snapshot = previous.cloned().unwrap_or_default();
        let before = snapshot.counts;

        match profile {
            Ok(profile) => snapshot.profile = profile,
            Err(e) => error!(user_id = %self.user_id, "error fetching profile: {}", e),
        }
        snapshot.counts = OfficerCounts {
            students: keep_or_log(students, before.students, CountQuery::Students),
            schools: keep_or_log(schools, before.schools, CountQuery::Schools),
            applications: keep_or_log(applications, before.applications, CountQuery::Applications),
            pending_approvals: keep_or_log(
                pending,
                before.pending_approvals,
                CountQuery::PendingOfficerApproval,
            ),
        };

        let previous_breakdown = snapshot.status_breakdown.clone();
        snapshot.status_breakdown = ApplicationStatus::ALL
            .iter()
            .zip(breakdown)
            .map(|(status, result)| {
                let before = previous_breakdown
                    .iter()
                    .find(|(s, _)| s == status)
                    .map(|(_, count)| *count)
                    .unwrap_or(0);
                let query = CountQuery::ApplicationsWithStatus(*status);
                (*status, keep_or_log(result, before, query))
            })
            .collect();

        snapshot
    }
}
