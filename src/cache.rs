//! Application rows kept by id so change notifications can be applied in place

use placement_realtime::{Change, ChangeKind};
use serde_json::Value;
use tracing::trace;

use crate::models::{Application, HasApplication};

/// Whether a changed row belongs in a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Relevant,
    Irrelevant,
    /// The view cannot tell from the row alone
    Unknown,
}

/// What applying a change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The cache changed
    Applied,
    /// The change does not concern the cached rows
    Ignored,
    /// The change cannot be applied locally; reload instead
    NeedsRefetch,
}

/// Ordered rows (as fetched, newest first) addressable by application id
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationCache<T> {
    rows: Vec<T>,
}

impl<T> Default for ApplicationCache<T> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<T: HasApplication> ApplicationCache<T> {
    pub fn from_rows(rows: Vec<T>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.rows.iter()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.rows.iter().find(|row| row.application().id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows.iter().position(|row| row.application().id == id)
    }

    /// Number of rows whose application satisfies `predicate`
    pub fn count_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Application) -> bool,
    {
        self.rows.iter().filter(|row| predicate(row.application())).count()
    }

    /// Apply one change notification. `relevance` classifies a row image
    /// that is not in the cache.
    pub fn apply<F>(&mut self, change: &Change, relevance: F) -> CacheOutcome
    where
        F: Fn(&Value) -> Relevance,
    {
        let Some(id) = change.row_id().map(str::to_string) else {
            return CacheOutcome::NeedsRefetch;
        };

        let outcome = match change.kind {
            ChangeKind::Delete => match self.position(&id) {
                Some(index) => {
                    self.rows.remove(index);
                    CacheOutcome::Applied
                }
                None => CacheOutcome::Ignored,
            },
            ChangeKind::Update => match self.position(&id) {
                Some(index) => self.patch(index, &change.record, &relevance),
                None => unseen_row(&change.record, &relevance),
            },
            // New rows need their embedded posting and school data.
            ChangeKind::Insert => unseen_row(&change.record, &relevance),
        };
        trace!(%id, kind = ?change.kind, ?outcome, "applied change to cache");
        outcome
    }

    fn patch<F>(&mut self, index: usize, record: &Value, relevance: &F) -> CacheOutcome
    where
        F: Fn(&Value) -> Relevance,
    {
        let updated = match serde_json::from_value::<Application>(record.clone()) {
            Ok(application) => application,
            Err(_) => return CacheOutcome::NeedsRefetch,
        };

        match relevance(record) {
            Relevance::Irrelevant => {
                self.rows.remove(index);
                return CacheOutcome::Applied;
            }
            Relevance::Unknown => return CacheOutcome::NeedsRefetch,
            Relevance::Relevant => {}
        }

        let current = self.rows[index].application_mut();
        // A different posting means different embedded rows.
        if current.posting_id != updated.posting_id {
            return CacheOutcome::NeedsRefetch;
        }
        *current = updated;
        CacheOutcome::Applied
    }
}

fn unseen_row<F>(record: &Value, relevance: &F) -> CacheOutcome
where
    F: Fn(&Value) -> Relevance,
{
    match relevance(record) {
        Relevance::Irrelevant => CacheOutcome::Ignored,
        Relevance::Relevant | Relevance::Unknown => CacheOutcome::NeedsRefetch,
    }
}
