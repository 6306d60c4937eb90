//! Plain-text rendering of the dashboards

use crate::dashboard::{OfficerSnapshot, SchoolSnapshot, Stat, StudentSnapshot};
use crate::models::{Notification, Profile};
use crate::role::Route;

pub const UNAVAILABLE: &str = "Unable to load dashboard";
pub const NO_STUDENT_APPLICATIONS: &str = "You haven't submitted any applications yet";
pub const NO_SCHOOL_APPLICATIONS: &str = "No applications yet";

fn header(lines: &mut Vec<String>, title: &str, profile: Option<&Profile>, tagline: &str) {
    lines.push(title.to_string());
    if let Some(profile) = profile {
        lines.push(profile.email.clone());
    }
    lines.push(String::new());
    let name = profile.map(|p| p.full_name.as_str()).unwrap_or_default();
    lines.push(format!("Welcome back, {}!", name));
    lines.push(tagline.to_string());
    lines.push(String::new());
}

fn stats(lines: &mut Vec<String>, stats: &[Stat]) {
    for stat in stats {
        lines.push(format!("{}: {}", stat.label, stat.value));
    }
    lines.push(String::new());
}

pub fn student(snapshot: &StudentSnapshot) -> String {
    let mut lines = Vec::new();
    header(
        &mut lines,
        "Student Dashboard",
        snapshot.profile.as_ref(),
        "Find teaching opportunities and track your applications",
    );
    stats(&mut lines, &snapshot.stats());

    lines.push("Available Opportunities".to_string());
    for open in &snapshot.open_postings {
        let posting = &open.posting;
        let school = open
            .schools
            .as_ref()
            .map(|s| s.school_name.as_str())
            .unwrap_or("Unknown school");
        lines.push(format!("- {} ({})", posting.title, school));
        lines.push(format!(
            "  Subject: {} | Duration: {} weeks",
            posting.subject_area, posting.duration_weeks
        ));
        if let Some(stipend) = posting.stipend_amount {
            lines.push(format!("  Stipend: KES {:.0}", stipend));
        }
    }
    lines.push(String::new());

    lines.push("My Applications".to_string());
    if snapshot.applications.is_empty() {
        lines.push(NO_STUDENT_APPLICATIONS.to_string());
    }
    for row in snapshot.applications.iter() {
        lines.push(format!(
            "- {} at {}: {}",
            row.posting_title().unwrap_or("Untitled posting"),
            row.school_name().unwrap_or("Unknown school"),
            row.application.status.label()
        ));
    }

    lines.join("\n")
}

pub fn school(snapshot: &SchoolSnapshot) -> String {
    let mut lines = Vec::new();
    header(
        &mut lines,
        "School Dashboard",
        snapshot.profile.as_ref(),
        "Manage your postings and review applications",
    );
    stats(&mut lines, &snapshot.stats());

    lines.push("Recent Applications".to_string());
    let recent = snapshot.recent_applications();
    if recent.is_empty() {
        lines.push(NO_SCHOOL_APPLICATIONS.to_string());
    }
    for row in recent {
        lines.push(format!(
            "- {} for {}: {}",
            row.applicant_name().unwrap_or("Unknown applicant"),
            row.school_postings.title,
            row.application.status.label()
        ));
    }

    lines.join("\n")
}

pub fn officer(snapshot: &OfficerSnapshot) -> String {
    let mut lines = Vec::new();
    header(
        &mut lines,
        "Education Officer Dashboard",
        snapshot.profile.as_ref(),
        "Monitor and oversee educational partnerships across your region",
    );
    stats(&mut lines, &snapshot.stats());

    lines.push("Application Status".to_string());
    for (status, count) in &snapshot.status_breakdown {
        lines.push(format!("{}: {}", status.label(), count));
    }

    lines.join("\n")
}

pub fn notifications(rows: &[Notification]) -> String {
    if rows.is_empty() {
        return "No unread notifications".to_string();
    }
    rows.iter()
        .map(|n| format!("* {}: {}", n.title, n.message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Text for the pages that are not dashboards
pub fn route(route: Route) -> &'static str {
    match route {
        Route::Landing => "Signed out.",
        Route::Auth => "Please sign in.",
        Route::Dashboard(_) => "",
    }
}

pub fn unavailable() -> &'static str {
    UNAVAILABLE
}
