use async_trait::async_trait;
use placement_realtime::Change;
use tracing::{error, info};

use super::{Dashboard, Stat, OPEN_POSTING_LIMIT};
use crate::backend::PlacementBackend;
use crate::cache::{ApplicationCache, CacheOutcome, Relevance};
use crate::error::{DashboardError, Result};
use crate::models::{
    Application, ApplicationStatus, NewApplication, OpenPosting, Profile, StudentApplication,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudentSnapshot {
    pub profile: Option<Profile>,
    /// `students.id`; `None` when the user has no student record
    pub student_id: Option<String>,
    pub open_postings: Vec<OpenPosting>,
    pub applications: ApplicationCache<StudentApplication>,
}

impl StudentSnapshot {
    pub fn total_applications(&self) -> usize {
        self.applications.len()
    }

    pub fn count_with_status(&self, status: ApplicationStatus) -> usize {
        self.applications.count_where(|a| a.status == status)
    }

    /// Applications, Pending, Approved
    pub fn stats(&self) -> Vec<Stat> {
        vec![
            Stat::new("Applications", self.total_applications() as u64),
            Stat::new("Pending", self.count_with_status(ApplicationStatus::Pending) as u64),
            Stat::new("Approved", self.count_with_status(ApplicationStatus::Approved) as u64),
        ]
    }
}

/// Open postings and the student's own applications
#[derive(Debug, Clone)]
pub struct StudentDashboard {
    user_id: String,
}

impl StudentDashboard {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn fetch_applications(
        &self,
        backend: &dyn PlacementBackend,
    ) -> Result<(Option<String>, Vec<StudentApplication>)> {
        match backend.student_id_for(&self.user_id).await? {
            Some(student_id) => {
                let rows = backend.student_applications(&student_id).await?;
                Ok((Some(student_id), rows))
            }
            None => Ok((None, Vec::new())),
        }
    }

    /// Submit a pending application to a posting
    pub async fn apply(
        &self,
        backend: &dyn PlacementBackend,
        posting_id: &str,
        cover_letter: Option<String>,
    ) -> Result<Application> {
        let student_id = backend
            .student_id_for(&self.user_id)
            .await?
            .ok_or_else(|| DashboardError::not_found(format!("student record for {}", self.user_id)))?;

        let application = backend
            .insert_application(&NewApplication {
                student_id,
                posting_id: posting_id.to_string(),
                status: ApplicationStatus::Pending,
                cover_letter,
            })
            .await?;
        info!(application_id = %application.id, %posting_id, "application submitted");
        Ok(application)
    }
}

#[async_trait]
impl Dashboard for StudentDashboard {
    type Snapshot = StudentSnapshot;

    fn channel(&self) -> &'static str {
        "student-applications"
    }

    async fn load(
        &self,
        backend: &dyn PlacementBackend,
        previous: Option<&StudentSnapshot>,
    ) -> StudentSnapshot {
        let (profile, postings, applications) = tokio::join!(
            backend.profile(&self.user_id),
            backend.open_postings(OPEN_POSTING_LIMIT),
            self.fetch_applications(backend),
        );
        let mut snapshot = previous.cloned().unwrap_or_default();

        match profile {
            Ok(profile) => snapshot.profile = profile,
            Err(e) => error!(user_id = %self.user_id, "error fetching profile: {}", e),
        }
        match postings {
            Ok(rows) => snapshot.open_postings = rows,
            Err(e) => error!("error fetching open postings: {}", e),
        }
        match applications {
            Ok((student_id, rows)) => {
                snapshot.student_id = student_id;
                snapshot.applications = ApplicationCache::from_rows(rows);
            }
            Err(e) => error!(user_id = %self.user_id, "error fetching applications: {}", e),
        }
        snapshot
    }

    fn apply_change(&self, snapshot: &mut StudentSnapshot, change: &Change) -> CacheOutcome {
        let student_id = snapshot.student_id.clone();
        snapshot.applications.apply(change, |record| match &student_id {
            Some(id) if record.get("student_id").and_then(|v| v.as_str()) == Some(id.as_str()) => {
                Relevance::Relevant
            }
            Some(_) if record.get("student_id").is_some() => Relevance::Irrelevant,
            _ => Relevance::Unknown,
        })
    }
}
