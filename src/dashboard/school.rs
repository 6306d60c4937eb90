use async_trait::async_trait;
use placement_realtime::Change;
use std::collections::HashSet;
use tracing::{error, info};

use super::{Dashboard, Stat, RECENT_APPLICATION_LIMIT};
use crate::backend::PlacementBackend;
use crate::cache::{ApplicationCache, CacheOutcome, Relevance};
use crate::error::Result;
use crate::models::{Application, ApplicationStatus, Profile, SchoolApplication, SchoolPosting};

/// A school's verdict on an application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn status(&self) -> ApplicationStatus {
        match self {
            Decision::Approve => ApplicationStatus::Approved,
            Decision::Reject => ApplicationStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchoolSnapshot {
    pub profile: Option<Profile>,
    /// `schools.id`; `None` when the user has no school record
    pub school_id: Option<String>,
    pub postings: Vec<SchoolPosting>,
    pub applications: ApplicationCache<SchoolApplication>,
}

impl SchoolSnapshot {
    pub fn active_postings(&self) -> usize {
        self.postings.iter().filter(|p| p.is_open()).count()
    }

    pub fn approved(&self) -> usize {
        self.applications
            .count_where(|a| a.status == ApplicationStatus::Approved)
    }

    /// Active Postings, Total Applications, Approved
    pub fn stats(&self) -> Vec<Stat> {
        vec![
            Stat::new("Active Postings", self.active_postings() as u64),
            Stat::new("Total Applications", self.applications.len() as u64),
            Stat::new("Approved", self.approved() as u64),
        ]
    }

    /// The newest applications shown in the list
    pub fn recent_applications(&self) -> &[SchoolApplication] {
        let rows = self.applications.rows();
        &rows[..rows.len().min(RECENT_APPLICATION_LIMIT)]
    }
}

/// The school's postings and the applications they received
#[derive(Debug, Clone)]
pub struct SchoolDashboard {
    user_id: String,
}

impl SchoolDashboard {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn fetch_rows(
        &self,
        backend: &dyn PlacementBackend,
    ) -> Result<(Option<String>, Vec<SchoolPosting>, Vec<SchoolApplication>)> {
        let Some(school_id) = backend.school_id_for(&self.user_id).await? else {
            return Ok((None, Vec::new(), Vec::new()));
        };
        let (postings, applications) = tokio::try_join!(
            backend.school_postings(&school_id),
            backend.school_applications(&school_id),
        )?;
        Ok((Some(school_id), postings, applications))
    }

    /// Approve or reject an application to one of the school's postings
    pub async fn review(
        &self,
        backend: &dyn PlacementBackend,
        application_id: &str,
        decision: Decision,
    ) -> Result<Application> {
        let application = backend
            .set_application_status(application_id, decision.status())
            .await?;
        info!(%application_id, ?decision, "application reviewed");
        Ok(application)
    }
}

#[async_trait]
impl Dashboard for SchoolDashboard {
    type Snapshot = SchoolSnapshot;

    fn channel(&self) -> &'static str {
        "school-applications"
    }

    async fn load(
        &self,
        backend: &dyn PlacementBackend,
        previous: Option<&SchoolSnapshot>,
    ) -> SchoolSnapshot {
        let (profile, rows) = tokio::join!(backend.profile(&self.user_id), self.fetch_rows(backend));
        let mut snapshot = previous.cloned().unwrap_or_default();

        match profile {
            Ok(profile) => snapshot.profile = profile,
            Err(e) => error!(user_id = %self.user_id, "error fetching profile: {}", e),
        }
        match rows {
            Ok((school_id, postings, applications)) => {
                snapshot.school_id = school_id;
                snapshot.postings = postings;
                snapshot.applications = ApplicationCache::from_rows(applications);
            }
            Err(e) => error!(user_id = %self.user_id, "error fetching postings and applications: {}", e),
        }
        snapshot
    }

    /// Rows on postings the school does not own are ignored; postings are the
    /// ones from the last full load.
    fn apply_change(&self, snapshot: &mut SchoolSnapshot, change: &Change) -> CacheOutcome {
        if snapshot.school_id.is_none() {
            return CacheOutcome::NeedsRefetch;
        }
        let own_postings: HashSet<String> = snapshot.postings.iter().map(|p| p.id.clone()).collect();
        snapshot.applications.apply(change, |record| {
            match record.get("posting_id").and_then(|v| v.as_str()) {
                Some(posting_id) if own_postings.contains(posting_id) => Relevance::Relevant,
                Some(_) => Relevance::Irrelevant,
                None => Relevance::Unknown,
            }
        })
    }
}
