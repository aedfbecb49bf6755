use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::datetime::{CanonicalDate, lenient_date};

const TEMPORARY_PREFIX: &str = "tmp-";

/// Opaque, stable entity identifier. The server may hand out numbers or
/// strings; both are kept in their textual form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Placeholder id for an optimistic create that the server has not
    /// confirmed yet.
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        let id = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text,
            Raw::Signed(n) => n.to_string(),
            Raw::Unsigned(n) => n.to_string(),
        };
        if id.trim().is_empty() {
            return Err(serde::de::Error::custom("empty entity id"));
        }
        Ok(Self(id))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

fn default_interval() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceDescriptor {
    pub frequency: Frequency,

    #[serde(default = "default_interval")]
    pub interval: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_days: Vec<String>,
}

impl RecurrenceDescriptor {
    pub fn every(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            selected_days: vec![],
        }
    }
}

/// A schedulable unit of work ("step").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: EntityId,

    #[serde(default)]
    pub title: String,

    #[serde(default, with = "lenient_date", alias = "date")]
    pub scheduled_date: Option<CanonicalDate>,

    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub is_important: bool,

    #[serde(default)]
    pub is_urgent: bool,

    #[serde(default)]
    pub area_id: Option<EntityId>,

    #[serde(default)]
    pub goal_id: Option<EntityId>,

    /// Legacy recurrence template marker.
    #[serde(default)]
    pub hidden: bool,

    /// Set on legacy per-occurrence rows.
    #[serde(default)]
    pub parent_recurring_id: Option<EntityId>,

    #[serde(default)]
    pub recurrence: Option<RecurrenceDescriptor>,

    #[serde(default, with = "lenient_date")]
    pub current_instance_date: Option<CanonicalDate>,
}

impl WorkItem {
    pub fn new(id: EntityId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            scheduled_date: None,
            completed: false,
            is_important: false,
            is_urgent: false,
            area_id: None,
            goal_id: None,
            hidden: false,
            parent_recurring_id: None,
            recurrence: None,
            current_instance_date: None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    /// Template and per-occurrence rows are historical artifacts and never
    /// take part in scheduling.
    pub fn is_schedulable(&self) -> bool {
        !self.hidden && self.parent_recurring_id.is_none()
    }

    /// Recurring items are never done; only the non-recurring flag counts.
    pub fn is_done(&self) -> bool {
        !self.is_recurring() && self.completed
    }

    pub fn priority_score(&self) -> u8 {
        2 * u8::from(self.is_important) + u8::from(self.is_urgent)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HabitFrequency {
    Daily,
    Weekly,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    pub id: EntityId,

    pub name: String,

    pub frequency: HabitFrequency,

    #[serde(default)]
    pub selected_days: Vec<String>,

    #[serde(default)]
    pub reminder_time: Option<String>,

    #[serde(default)]
    pub area_id: Option<EntityId>,

    /// Append-only ledger keyed by `YYYY-MM-DD`.
    #[serde(default)]
    pub completions: BTreeMap<String, bool>,
}

impl Habit {
    pub fn new(id: EntityId, name: impl Into<String>, frequency: HabitFrequency) -> Self {
        Self {
            id,
            name: name.into(),
            frequency,
            selected_days: vec![],
            reminder_time: None,
            area_id: None,
            completions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: EntityId,

    pub area_id: EntityId,

    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default, with = "lenient_date")]
    pub completed_date: Option<CanonicalDate>,

    #[serde(default)]
    pub progress: i32,

    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Milestone {
    pub fn new(id: EntityId, area_id: EntityId, title: impl Into<String>) -> Self {
        Self {
            id,
            area_id,
            title: title.into(),
            description: None,
            completed_date: None,
            progress: 0,
            created_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub id: EntityId,

    pub name: String,

    #[serde(default)]
    pub color: String,

    #[serde(default)]
    pub icon: String,
}

impl Area {
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: String::new(),
            icon: String::new(),
        }
    }
}
