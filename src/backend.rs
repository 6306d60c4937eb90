//! Data access used by the dashboards
//!
//! [`PlacementBackend`] is the seam between the dashboards and the hosted
//! backend. [`SupabaseBackend`] implements it over the auth, PostgREST and
//! realtime crates; tests substitute an in-memory implementation.

use async_trait::async_trait;
use placement_auth::{Auth, AuthChangeEvent, AuthOptions, Session};
use placement_postgrest::{CountMethod, PostgrestClient, SortOrder};
use placement_realtime::{
    Change, PostgresChanges, RealtimeClient, RealtimeClientOptions, Subscription,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::{DashboardError, Result};
use crate::models::{
    Application, ApplicationStatus, NewApplication, Notification, OpenPosting, Profile,
    SchoolApplication, SchoolPosting, StudentApplication,
};

pub const APPLICATIONS_TABLE: &str = "applications";

/// A session whose token expires within this many seconds is refreshed
/// before it is used
pub const REFRESH_MARGIN_SECS: i64 = 60;

const OPEN_POSTING_SELECT: &str = "*,schools(school_name,location)";
const STUDENT_APPLICATION_SELECT: &str = "*,school_postings(title,schools(school_name))";
const SCHOOL_APPLICATION_SELECT: &str =
    "*,school_postings!inner(title,school_id),students(user_id,profiles(full_name,email))";

/// Row counts the officer view asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountQuery {
    Students,
    Schools,
    Applications,
    /// Applications with `officer_approved = false`
    PendingOfficerApproval,
    ApplicationsWithStatus(ApplicationStatus),
}

/// Change notifications for the `applications` table. Dropping the feed
/// leaves the underlying channel.
pub struct ChangeFeed {
    pub changes: mpsc::Receiver<Change>,
    _subscription: Option<Subscription>,
}

impl ChangeFeed {
    /// A feed with no server-side channel behind it
    pub fn new(changes: mpsc::Receiver<Change>) -> Self {
        Self {
            changes,
            _subscription: None,
        }
    }

    pub fn with_subscription(subscription: Subscription, changes: mpsc::Receiver<Change>) -> Self {
        Self {
            changes,
            _subscription: Some(subscription),
        }
    }

    pub async fn recv(&mut self) -> Option<Change> {
        self.changes.recv().await
    }
}

#[async_trait]
pub trait PlacementBackend: Send + Sync {
    /// Id of the signed-in user, if any
    async fn current_user_id(&self) -> Result<Option<String>>;

    /// Auth-state changes (sign-in, sign-out, refresh)
    fn auth_events(&self) -> broadcast::Receiver<AuthChangeEvent>;

    /// Raw `profiles.role` for a user; `None` when there is no profile row
    async fn role_of(&self, user_id: &str) -> Result<Option<String>>;

    async fn profile(&self, user_id: &str) -> Result<Option<Profile>>;

    /// `students.id` for the user's student record
    async fn student_id_for(&self, user_id: &str) -> Result<Option<String>>;

    /// `schools.id` for the user's school record
    async fn school_id_for(&self, user_id: &str) -> Result<Option<String>>;

    /// `education_officers.id` for the user's officer record
    async fn officer_id_for(&self, user_id: &str) -> Result<Option<String>>;

    /// Newest open postings with school name and location
    async fn open_postings(&self, limit: usize) -> Result<Vec<OpenPosting>>;

    /// A student's applications, newest first
    async fn student_applications(&self, student_id: &str) -> Result<Vec<StudentApplication>>;

    /// A school's postings, newest first
    async fn school_postings(&self, school_id: &str) -> Result<Vec<SchoolPosting>>;

    /// Applications to a school's postings, newest first
    async fn school_applications(&self, school_id: &str) -> Result<Vec<SchoolApplication>>;

    async fn count(&self, query: CountQuery) -> Result<u64>;

    async fn insert_application(&self, application: &NewApplication) -> Result<Application>;

    async fn set_application_status(
        &self,
        application_id: &str,
        status: ApplicationStatus,
    ) -> Result<Application>;

    /// Mark an application officer-approved by the given officer
    async fn approve_application(&self, application_id: &str, officer_id: &str)
        -> Result<Application>;

    /// Unread notifications, newest first
    async fn unread_notifications(&self, user_id: &str) -> Result<Vec<Notification>>;

    /// Subscribe to every change on `applications` under channel `name`
    async fn subscribe_applications(&self, name: &str) -> Result<ChangeFeed>;

    async fn sign_out(&self) -> Result<()>;
}

#[derive(Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Deserialize)]
struct RoleRow {
    role: String,
}

/// [`PlacementBackend`] over the hosted auth, rest and realtime endpoints
pub struct SupabaseBackend {
    url: String,
    key: String,
    http_client: Client,
    auth: Auth,
    realtime: RealtimeClient,
    refresh_lock: Mutex<()>,
}

impl SupabaseBackend {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DashboardError::config(format!("cannot build HTTP client: {}", e)))?;
        let url = config.base_url();

        let auth = Auth::new(&url, &config.anon_key, http_client.clone(), AuthOptions::default());
        let realtime = RealtimeClient::new_with_options(
            &url,
            &config.anon_key,
            RealtimeClientOptions {
                heartbeat_interval: config.heartbeat_interval,
                ..Default::default()
            },
        );

        Ok(Self {
            url,
            key: config.anon_key.clone(),
            http_client,
            auth,
            realtime,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn realtime(&self) -> &RealtimeClient {
        &self.realtime
    }

    /// The current session. A token about to expire is exchanged first and
    /// the new one handed to the realtime client; one refresh runs at a time.
    pub async fn session(&self) -> Result<Option<Session>> {
        match self.auth.get_session() {
            Some(session) if !session.expires_within(REFRESH_MARGIN_SECS) => return Ok(Some(session)),
            None => return Ok(None),
            Some(_) => {}
        }

        let _guard = self.refresh_lock.lock().await;
        // Re-read: another caller may have refreshed while this one waited.
        match self.auth.get_session() {
            Some(session) if !session.expires_within(REFRESH_MARGIN_SECS) => Ok(Some(session)),
            None => Ok(None),
            Some(_) => {
                debug!("access token about to expire, refreshing session");
                let session = self.auth.refresh_session().await?;
                self.realtime.set_auth(Some(session.access_token.clone()));
                Ok(Some(session))
            }
        }
    }

    /// Check the session every `period` so the token stays valid while
    /// nothing else is querying. Stops once the backend is dropped.
    pub fn keep_session_fresh(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let backend: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(backend) = backend.upgrade() else { break };
                if let Err(e) = backend.session().await {
                    warn!("session refresh failed: {}", e);
                }
            }
        })
    }

    /// Query builder for `table`, carrying the session token when signed in
    pub async fn from(&self, table: &str) -> Result<PostgrestClient> {
        let client = PostgrestClient::new(&self.url, &self.key, table, self.http_client.clone());
        match self.session().await? {
            Some(session) => Ok(client.with_auth(&session.access_token)?),
            None => Ok(client),
        }
    }

    async fn id_for(&self, table: &str, user_id: &str) -> Result<Option<String>> {
        let row = self
            .from(table)
            .await?
            .select("id")
            .eq("user_id", user_id)
            .maybe_single::<IdRow>()
            .await?;
        Ok(row.map(|r| r.id))
    }

    fn single_row<T>(rows: Vec<T>, what: &str, id: &str) -> Result<T> {
        rows.into_iter()
            .next()
            .ok_or_else(|| DashboardError::not_found(format!("{} {}", what, id)))
    }
}

#[async_trait]
impl PlacementBackend for SupabaseBackend {
    async fn current_user_id(&self) -> Result<Option<String>> {
        Ok(self.session().await?.map(|s| s.user.id))
    }

    fn auth_events(&self) -> broadcast::Receiver<AuthChangeEvent> {
        self.auth.on_auth_state_change()
    }

    async fn role_of(&self, user_id: &str) -> Result<Option<String>> {
        let row = self
            .from("profiles")
            .await?
            .select("role")
            .eq("id", user_id)
            .maybe_single::<RoleRow>()
            .await?;
        Ok(row.map(|r| r.role))
    }

    async fn profile(&self, user_id: &str) -> Result<Option<Profile>> {
        Ok(self
            .from("profiles")
            .await?
            .select("*")
            .eq("id", user_id)
            .maybe_single::<Profile>()
            .await?)
    }

    async fn student_id_for(&self, user_id: &str) -> Result<Option<String>> {
        self.id_for("students", user_id).await
    }

    async fn school_id_for(&self, user_id: &str) -> Result<Option<String>> {
        self.id_for("schools", user_id).await
    }

    async fn officer_id_for(&self, user_id: &str) -> Result<Option<String>> {
        self.id_for("education_officers", user_id).await
    }

    async fn open_postings(&self, limit: usize) -> Result<Vec<OpenPosting>> {
        Ok(self
            .from("school_postings")
            .await?
            .select(OPEN_POSTING_SELECT)
            .eq("status", "open")
            .order("created_at", SortOrder::Descending)
            .limit(limit)
            .execute()
            .await?)
    }

    async fn student_applications(&self, student_id: &str) -> Result<Vec<StudentApplication>> {
        Ok(self
            .from(APPLICATIONS_TABLE)
            .await?
            .select(STUDENT_APPLICATION_SELECT)
            .eq("student_id", student_id)
            .order("created_at", SortOrder::Descending)
            .execute()
            .await?)
    }

    async fn school_postings(&self, school_id: &str) -> Result<Vec<SchoolPosting>> {
        Ok(self
            .from("school_postings")
            .await?
            .select("*")
            .eq("school_id", school_id)
            .order("created_at", SortOrder::Descending)
            .execute()
            .await?)
    }

    async fn school_applications(&self, school_id: &str) -> Result<Vec<SchoolApplication>> {
        Ok(self
            .from(APPLICATIONS_TABLE)
            .await?
            .select(SCHOOL_APPLICATION_SELECT)
            .eq("school_postings.school_id", school_id)
            .order("created_at", SortOrder::Descending)
            .execute()
            .await?)
    }

    async fn count(&self, query: CountQuery) -> Result<u64> {
        let builder = match query {
            CountQuery::Students => self.from("students").await?,
            CountQuery::Schools => self.from("schools").await?,
            CountQuery::Applications => self.from(APPLICATIONS_TABLE).await?,
            CountQuery::PendingOfficerApproval => {
                self.from(APPLICATIONS_TABLE).await?.eq("officer_approved", false)
            }
            CountQuery::ApplicationsWithStatus(status) => {
                self.from(APPLICATIONS_TABLE).await?.eq("status", status.as_str())
            }
        };
        let total = builder.select("id").count(CountMethod::Exact).await?;
        debug!(?query, total, "counted rows");
        Ok(total)
    }

    async fn insert_application(&self, application: &NewApplication) -> Result<Application> {
        let rows: Vec<Application> = self
            .from(APPLICATIONS_TABLE)
            .await?
            .insert(application)
            .await?;
        Self::single_row(rows, "inserted application for posting", &application.posting_id)
    }

    async fn set_application_status(
        &self,
        application_id: &str,
        status: ApplicationStatus,
    ) -> Result<Application> {
        let rows: Vec<Application> = self
            .from(APPLICATIONS_TABLE)
            .await?
            .eq("id", application_id)
            .update(&json!({ "status": status }))
            .await?;
        Self::single_row(rows, "application", application_id)
    }

    async fn approve_application(
        &self,
        application_id: &str,
        officer_id: &str,
    ) -> Result<Application> {
        let rows: Vec<Application> = self
            .from(APPLICATIONS_TABLE)
            .await?
            .eq("id", application_id)
            .update(&json!({ "officer_approved": true, "officer_id": officer_id }))
            .await?;
        Self::single_row(rows, "application", application_id)
    }

    async fn unread_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        Ok(self
            .from("notifications")
            .await?
            .select("*")
            .eq("user_id", user_id)
            .not("read", "is", "true")
            .order("created_at", SortOrder::Descending)
            .execute()
            .await?)
    }

    async fn subscribe_applications(&self, name: &str) -> Result<ChangeFeed> {
        self.realtime
            .set_auth(self.session().await?.map(|session| session.access_token));
        let (subscription, changes) = self
            .realtime
            .subscribe(PostgresChanges::new(name, APPLICATIONS_TABLE))
            .await?;
        Ok(ChangeFeed::with_subscription(subscription, changes))
    }

    async fn sign_out(&self) -> Result<()> {
        let result = self.auth.sign_out().await;
        self.realtime.disconnect();
        Ok(result?)
    }
}
