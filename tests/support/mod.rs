#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use placement_dashboards::auth::AuthChangeEvent;
use placement_dashboards::backend::{ChangeFeed, CountQuery, PlacementBackend};
use placement_dashboards::error::{DashboardError, Result};
use placement_dashboards::models::{
    Application, ApplicationStatus, NewApplication, Notification, OpenPosting, PostingRef,
    PostingStatus, PostingWithSchool, Profile, SchoolApplication, SchoolPosting, SchoolSummary,
    StudentApplication, UserRole,
};
use placement_dashboards::postgrest::PostgrestError;
use placement_dashboards::realtime::{Change, ChangeKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;
use tokio::sync::{broadcast, mpsc};

pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn profile(id: &str, name: &str, role: UserRole) -> Profile {
    Profile {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        full_name: name.to_string(),
        phone: None,
        role,
        created_at: at(0),
        updated_at: at(0),
    }
}

pub fn posting(id: &str, school_id: &str, title: &str, status: PostingStatus) -> SchoolPosting {
    SchoolPosting {
        id: id.to_string(),
        school_id: school_id.to_string(),
        title: title.to_string(),
        description: format!("{} placement", title),
        subject_area: title.to_string(),
        duration_weeks: 12,
        stipend_amount: Some(15000.0),
        required_skills: None,
        status,
        start_date: NaiveDate::from_ymd_opt(2024, 9, 2).unwrap(),
        created_at: at(1),
        updated_at: at(1),
    }
}

pub fn application(id: &str, student_id: &str, posting_id: &str, status: ApplicationStatus) -> Application {
    Application {
        id: id.to_string(),
        student_id: student_id.to_string(),
        posting_id: posting_id.to_string(),
        status,
        officer_approved: Some(false),
        officer_id: None,
        cover_letter: None,
        created_at: at(10),
        updated_at: at(10),
    }
}

/// Row image as the change feed would carry it
pub fn record(application: &Application) -> serde_json::Value {
    serde_json::to_value(application).unwrap()
}

pub fn change(kind: ChangeKind, record: serde_json::Value, old_record: serde_json::Value) -> Change {
    Change {
        schema: "public".to_string(),
        table: "applications".to_string(),
        kind,
        commit_timestamp: Some("2024-05-01T10:00:00Z".to_string()),
        record,
        old_record,
    }
}

pub fn notification(id: &str, user_id: &str, read: Option<bool>, minutes: i64) -> Notification {
    Notification {
        id: id.to_string(),
        user_id: user_id.to_string(),
        title: format!("Notice {}", id),
        message: format!("Message {}", id),
        link: None,
        read,
        created_at: at(minutes),
    }
}

pub fn update_of(application: &Application) -> Change {
    change(ChangeKind::Update, record(application), json!({ "id": application.id }))
}

#[derive(Default)]
pub struct FakeState {
    pub user_id: Option<String>,
    pub roles: HashMap<String, String>,
    pub fail_role_lookup: bool,
    pub fail_open_postings: bool,
    pub profiles: HashMap<String, Profile>,
    /// user id -> record id
    pub students: HashMap<String, String>,
    pub schools: HashMap<String, String>,
    pub officers: HashMap<String, String>,
    pub school_names: HashMap<String, String>,
    pub postings: Vec<SchoolPosting>,
    /// Newest first
    pub applications: Vec<Application>,
    pub notifications: Vec<Notification>,
}

/// In-memory backend with a change feed the test drives
pub struct FakeBackend {
    pub state: Mutex<FakeState>,
    auth_events: broadcast::Sender<AuthChangeEvent>,
    feed: Mutex<Option<mpsc::Sender<Change>>>,
    /// Committed into the feed, if one is open, by the next application load
    pub commit_during_load: Mutex<Option<Change>>,
    pub subscriptions: AtomicUsize,
    pub application_loads: AtomicUsize,
    pub count_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(state: FakeState) -> Self {
        let (auth_events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(state),
            auth_events,
            feed: Mutex::new(None),
            commit_during_load: Mutex::new(None),
            subscriptions: AtomicUsize::new(0),
            application_loads: AtomicUsize::new(0),
            count_calls: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: AuthChangeEvent) {
        let _ = self.auth_events.send(event);
    }

    pub async fn push(&self, change: Change) {
        let sender = self.feed.lock().unwrap().clone().expect("nobody subscribed");
        sender.send(change).await.expect("feed closed");
    }

    /// True once the subscriber dropped its end of the feed
    pub fn feed_closed(&self) -> bool {
        self.feed
            .lock()
            .unwrap()
            .as_ref()
            .map(|sender| sender.is_closed())
            .unwrap_or(true)
    }

    /// A write that lands while a load is in flight. Without an open feed
    /// nobody hears about it.
    fn commit_pending_change(&self) {
        let Some(change) = self.commit_during_load.lock().unwrap().take() else {
            return;
        };
        if let Some(sender) = self.feed.lock().unwrap().as_ref() {
            let _ = sender.try_send(change);
        }
    }

    pub fn loads(&self) -> usize {
        self.application_loads.load(Ordering::SeqCst)
    }

    fn posting(&self, posting_id: &str) -> Option<SchoolPosting> {
        let state = self.state.lock().unwrap();
        state.postings.iter().find(|p| p.id == posting_id).cloned()
    }

    fn school_name(&self, school_id: &str) -> Option<String> {
        self.state.lock().unwrap().school_names.get(school_id).cloned()
    }

    fn update<F>(&self, application_id: &str, edit: F) -> Result<Application>
    where
        F: FnOnce(&mut Application),
    {
        let mut state = self.state.lock().unwrap();
        let row = state
            .applications
            .iter_mut()
            .find(|a| a.id == application_id)
            .ok_or_else(|| DashboardError::not_found(format!("application {}", application_id)))?;
        edit(row);
        Ok(row.clone())
    }
}

#[async_trait]
impl PlacementBackend for FakeBackend {
    async fn current_user_id(&self) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().user_id.clone())
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthChangeEvent> {
        self.auth_events.subscribe()
    }

    async fn role_of(&self, user_id: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_role_lookup {
            return Err(PostgrestError::UnparsedApiError {
                message: "connection reset".to_string(),
                status: reqwest::StatusCode::BAD_GATEWAY,
            }
            .into());
        }
        Ok(state.roles.get(user_id).cloned())
    }

    async fn profile(&self, user_id: &str) -> Result<Option<Profile>> {
        Ok(self.state.lock().unwrap().profiles.get(user_id).cloned())
    }

    async fn student_id_for(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().students.get(user_id).cloned())
    }

    async fn school_id_for(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().schools.get(user_id).cloned())
    }

    async fn officer_id_for(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().officers.get(user_id).cloned())
    }

    async fn open_postings(&self, limit: usize) -> Result<Vec<OpenPosting>> {
        let postings = {
            let state = self.state.lock().unwrap();
            if state.fail_open_postings {
                return Err(PostgrestError::InvalidParameters("offline".to_string()).into());
            }
            state.postings.clone()
        };
        Ok(postings
            .into_iter()
            .filter(|p| p.is_open())
            .take(limit)
            .map(|posting| {
                let schools = self.school_name(&posting.school_id).map(|school_name| SchoolSummary {
                    school_name,
                    location: Some("Nairobi".to_string()),
                });
                OpenPosting { posting, schools }
            })
            .collect())
    }

    async fn student_applications(&self, student_id: &str) -> Result<Vec<StudentApplication>> {
        self.application_loads.fetch_add(1, Ordering::SeqCst);
        self.commit_pending_change();
        let rows: Vec<Application> = {
            let state = self.state.lock().unwrap();
            state
                .applications
                .iter()
                .filter(|a| a.student_id == student_id)
                .cloned()
                .collect()
        };
        Ok(rows
            .into_iter()
            .map(|application| {
                let school_postings = self.posting(&application.posting_id).map(|p| PostingWithSchool {
                    title: p.title.clone(),
                    schools: self.school_name(&p.school_id).map(|school_name| SchoolSummary {
                        school_name,
                        location: None,
                    }),
                });
                StudentApplication {
                    application,
                    school_postings,
                }
            })
            .collect())
    }

    async fn school_postings(&self, school_id: &str) -> Result<Vec<SchoolPosting>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .postings
            .iter()
            .filter(|p| p.school_id == school_id)
            .cloned()
            .collect())
    }

    async fn school_applications(&self, school_id: &str) -> Result<Vec<SchoolApplication>> {
        self.application_loads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(state
            .applications
            .iter()
            .filter_map(|application| {
                let posting = state
                    .postings
                    .iter()
                    .find(|p| p.id == application.posting_id && p.school_id == school_id)?;
                Some(SchoolApplication {
                    application: application.clone(),
                    school_postings: PostingRef {
                        title: posting.title.clone(),
                        school_id: posting.school_id.clone(),
                    },
                    students: None,
                })
            })
            .collect())
    }

    async fn count(&self, query: CountQuery) -> Result<u64> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let total = match query {
            CountQuery::Students => state.students.len(),
            CountQuery::Schools => state.schools.len(),
            CountQuery::Applications => state.applications.len(),
            CountQuery::PendingOfficerApproval => state
                .applications
                .iter()
                .filter(|a| a.officer_approved == Some(false))
                .count(),
            CountQuery::ApplicationsWithStatus(status) => {
                state.applications.iter().filter(|a| a.status == status).count()
            }
        };
        Ok(total as u64)
    }

    async fn insert_application(&self, new: &NewApplication) -> Result<Application> {
        let mut state = self.state.lock().unwrap();
        let mut row = application(
            &format!("app-{}", state.applications.len() + 1),
            &new.student_id,
            &new.posting_id,
            new.status,
        );
        row.cover_letter = new.cover_letter.clone();
        state.applications.insert(0, row.clone());
        Ok(row)
    }

    async fn set_application_status(
        &self,
        application_id: &str,
        status: ApplicationStatus,
    ) -> Result<Application> {
        self.update(application_id, |a| a.status = status)
    }

    async fn approve_application(
        &self,
        application_id: &str,
        officer_id: &str,
    ) -> Result<Application> {
        self.update(application_id, |a| {
            a.officer_approved = Some(true);
            a.officer_id = Some(officer_id.to_string());
        })
    }

    async fn unread_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && n.read != Some(true))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn subscribe_applications(&self, _name: &str) -> Result<ChangeFeed> {
        let (sender, receiver) = mpsc::channel(16);
        *self.feed.lock().unwrap() = Some(sender);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(ChangeFeed::new(receiver))
    }

    async fn sign_out(&self) -> Result<()> {
        self.state.lock().unwrap().user_id = None;
        self.emit(AuthChangeEvent::SignedOut);
        Ok(())
    }
}

/// Poll until `condition` holds or a second passes
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    condition()
}
