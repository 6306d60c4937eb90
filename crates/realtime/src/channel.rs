use crate::client::Shared;
use crate::message::{ChangeEvent, RealtimeMessage, PHX_LEAVE};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

const SCHEMA: &str = "public";

/// Row change subscription settings for one table in the `public` schema
#[derive(Debug, Clone)]
pub struct PostgresChanges {
    name: String,
    table: String,
    event: ChangeEvent,
    filter: Option<String>,
}

impl PostgresChanges {
    /// `name` becomes the channel topic `realtime:<name>`
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            event: ChangeEvent::All,
            filter: None,
        }
    }

    pub fn event(mut self, event: ChangeEvent) -> Self {
        self.event = event;
        self
    }

    /// Server-side row filter, e.g. `eq("student_id", "s1")`
    pub fn eq(mut self, column: &str, value: &str) -> Self {
        self.filter = Some(format!("{}=eq.{}", column, value));
        self
    }

    pub fn topic(&self) -> String {
        format!("realtime:{}", self.name)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn event_filter(&self) -> ChangeEvent {
        self.event
    }

    pub(crate) fn to_config(&self) -> Value {
        let mut config = json!({
            "event": self.event.as_str(),
            "schema": SCHEMA,
            "table": self.table,
        });
        if let Some(filter) = &self.filter {
            config["filter"] = json!(filter);
        }
        config
    }
}

/// Live channel subscription; leaving happens on `unsubscribe` or drop
pub struct Subscription {
    shared: Arc<Shared>,
    topic: String,
    left: bool,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<Shared>, topic: String) -> Self {
        Self {
            shared,
            topic,
            left: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        self.leave();
    }

    fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        let had_channel = self.shared.remove_channel(&self.topic);
        if had_channel {
            let leave = RealtimeMessage::new(
                &self.topic,
                PHX_LEAVE,
                json!({}),
                Some(self.shared.next_ref()),
            );
            // The socket may already be gone; leaving is then implicit.
            let _ = self.shared.send(&leave);
        }
        debug!(topic = %self.topic, "left channel");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.leave();
    }
}
