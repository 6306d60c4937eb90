//! Typed rows of the placement schema

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which dashboard a profile gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    SchoolAdmin,
    EducationOfficer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Student => "student",
            UserRole::SchoolAdmin => "school_admin",
            UserRole::EducationOfficer => "education_officer",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown role '{0}'")]
pub struct RoleParseError(pub String);

impl FromStr for UserRole {
    type Err = RoleParseError;

    /// Exact match only; no trimming or case folding
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(UserRole::Student),
            "school_admin" => Ok(UserRole::SchoolAdmin),
            "education_officer" => Ok(UserRole::EducationOfficer),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub user_id: String,
    /// Registration number issued by the university
    pub student_id: String,
    pub university: String,
    pub course: String,
    pub year_of_study: i32,
    #[serde(default)]
    pub skills: Option<Vec<String>>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub kuccps_verified: Option<bool>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    pub id: String,
    pub user_id: String,
    pub school_name: String,
    pub location: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub contact_person: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EducationOfficer {
    pub id: String,
    pub user_id: String,
    pub office_name: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
}

/// Posting status is free text in the schema; `open` and `closed` are the ones
/// the dashboards care about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PostingStatus {
    Open,
    Closed,
    Other(String),
}

impl From<String> for PostingStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "open" => PostingStatus::Open,
            "closed" => PostingStatus::Closed,
            _ => PostingStatus::Other(value),
        }
    }
}

impl From<PostingStatus> for String {
    fn from(value: PostingStatus) -> Self {
        match value {
            PostingStatus::Open => "open".to_string(),
            PostingStatus::Closed => "closed".to_string(),
            PostingStatus::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolPosting {
    pub id: String,
    pub school_id: String,
    pub title: String,
    pub description: String,
    pub subject_area: String,
    pub duration_weeks: i32,
    #[serde(default)]
    pub stipend_amount: Option<f64>,
    #[serde(default)]
    pub required_skills: Option<Vec<String>>,
    pub status: PostingStatus,
    pub start_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchoolPosting {
    pub fn is_open(&self) -> bool {
        self.status == PostingStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 4] = [
        ApplicationStatus::Pending,
        ApplicationStatus::Approved,
        ApplicationStatus::Rejected,
        ApplicationStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Approved => "approved",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Completed => "completed",
        }
    }

    /// Capitalised form used in listings
    pub fn label(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "Pending",
            ApplicationStatus::Approved => "Approved",
            ApplicationStatus::Rejected => "Rejected",
            ApplicationStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub student_id: String,
    pub posting_id: String,
    pub status: ApplicationStatus,
    #[serde(default)]
    pub officer_approved: Option<bool>,
    #[serde(default)]
    pub officer_id: Option<String>,
    #[serde(default)]
    pub cover_letter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert body for a new application; the database fills in the rest
#[derive(Debug, Clone, Serialize)]
pub struct NewApplication {
    pub student_id: String,
    pub posting_id: String,
    pub status: ApplicationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_letter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub read: Option<bool>,
    pub created_at: DateTime<Utc>,
}

// Embedded resources. PostgREST names them after the joined table.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolSummary {
    pub school_name: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// Open posting with the offering school's name and location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosting {
    #[serde(flatten)]
    pub posting: SchoolPosting,
    #[serde(default)]
    pub schools: Option<SchoolSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingWithSchool {
    pub title: String,
    #[serde(default)]
    pub schools: Option<SchoolSummary>,
}

/// A student's own application with posting title and school name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentApplication {
    #[serde(flatten)]
    pub application: Application,
    #[serde(default)]
    pub school_postings: Option<PostingWithSchool>,
}

impl StudentApplication {
    pub fn posting_title(&self) -> Option<&str> {
        self.school_postings.as_ref().map(|p| p.title.as_str())
    }

    pub fn school_name(&self) -> Option<&str> {
        self.school_postings
            .as_ref()
            .and_then(|p| p.schools.as_ref())
            .map(|s| s.school_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingRef {
    pub title: String,
    pub school_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicantSummary {
    pub user_id: String,
    #[serde(default)]
    pub profiles: Option<ProfileSummary>,
}

/// An application to one of the school's postings, with the applicant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolApplication {
    #[serde(flatten)]
    pub application: Application,
    pub school_postings: PostingRef,
    #[serde(default)]
    pub students: Option<ApplicantSummary>,
}

impl SchoolApplication {
    pub fn applicant_name(&self) -> Option<&str> {
        self.students
            .as_ref()
            .and_then(|s| s.profiles.as_ref())
            .map(|p| p.full_name.as_str())
    }
}

/// Rows that wrap an `applications` row
pub trait HasApplication {
    fn application(&self) -> &Application;
    fn application_mut(&mut self) -> &mut Application;
}

impl HasApplication for StudentApplication {
    fn application(&self) -> &Application {
        &self.application
    }
    fn application_mut(&mut self) -> &mut Application {
        &mut self.application
    }
}

impl HasApplication for SchoolApplication {
    fn application(&self) -> &Application {
        &self.application
    }
    fn application_mut(&mut self) -> &mut Application {
        &mut self.application
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_parsing_is_exact() {
        assert_eq!("student".parse::<UserRole>(), Ok(UserRole::Student));
        assert_eq!("school_admin".parse::<UserRole>(), Ok(UserRole::SchoolAdmin));
        assert_eq!(
            "education_officer".parse::<UserRole>(),
            Ok(UserRole::EducationOfficer)
        );
        assert!("Student".parse::<UserRole>().is_err());
        assert!(" student".parse::<UserRole>().is_err());
        assert!("admin".parse::<UserRole>().is_err());
    }

    #[test]
    fn posting_status_keeps_unknown_values() {
        let status: PostingStatus = serde_json::from_value(json!("filled")).unwrap();
        assert_eq!(status, PostingStatus::Other("filled".to_string()));
        assert_eq!(serde_json::to_value(&status).unwrap(), json!("filled"));
        assert_eq!(
            serde_json::from_value::<PostingStatus>(json!("open")).unwrap(),
            PostingStatus::Open
        );
    }

    #[test]
    fn student_application_reads_embedded_posting() {
        let row: StudentApplication = serde_json::from_value(json!({
            "id": "a1",
            "student_id": "s1",
            "posting_id": "p1",
            "status": "pending",
            "officer_approved": null,
            "officer_id": null,
            "cover_letter": null,
            "created_at": "2024-05-01T10:00:00+00:00",
            "updated_at": "2024-05-01T10:00:00+00:00",
            "school_postings": { "title": "Maths Teacher", "schools": { "school_name": "Alliance High" } }
        }))
        .unwrap();

        assert_eq!(row.application.status, ApplicationStatus::Pending);
        assert_eq!(row.posting_title(), Some("Maths Teacher"));
        assert_eq!(row.school_name(), Some("Alliance High"));
    }

    #[test]
    fn new_application_omits_missing_cover_letter() {
        let body = serde_json::to_value(NewApplication {
            student_id: "s1".into(),
            posting_id: "p1".into(),
            status: ApplicationStatus::Pending,
            cover_letter: None,
        })
        .unwrap();
        assert_eq!(
            body,
            json!({ "student_id": "s1", "posting_id": "p1", "status": "pending" })
        );
    }
}
