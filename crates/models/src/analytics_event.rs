use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use ts_rs::TS;

use crate::click_category::ClickCategory;

/// Identifies who is being viewed, through which share configuration, and by which visit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct VisitScope {
    pub session_id: String,
    pub owner_code: String,
    pub share_code: String,
    #[serde(default)]
    pub contact_id: Option<String>,
}

impl VisitScope {
    pub fn new(
        session_id: impl Into<String>,
        owner_code: impl Into<String>,
        share_code: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            owner_code: owner_code.into(),
            share_code: share_code.into(),
            contact_id: None,
        }
    }

    pub fn with_contact(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct SessionEvent {
    pub session_id: String,
    pub owner_code: String,
    pub share_code: String,
    pub contact_id: Option<String>,
    pub visitor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub user_agent: String,
    pub referrer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PageViewEvent {
    pub session_id: String,
    pub owner_code: String,
    pub share_code: String,
    pub contact_id: Option<String>,
    pub page_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct ClickEvent {
    pub session_id: String,
    pub owner_code: String,
    pub share_code: String,
    pub contact_id: Option<String>,
    pub click_target: String,
    pub click_category: ClickCategory,
    pub timestamp: DateTime<Utc>,
}

/// Discriminant of [`AnalyticsEvent`], used in log fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Session,
    PageView,
    Click,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    Session(SessionEvent),
    PageView(PageViewEvent),
    Click(ClickEvent),
}

impl AnalyticsEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Session(_) => EventKind::Session,
            Self::PageView(_) => EventKind::PageView,
            Self::Click(_) => EventKind::Click,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Session(e) => &e.session_id,
            Self::PageView(e) => &e.session_id,
            Self::Click(e) => &e.session_id,
        }
    }

    pub fn session(
        scope: &VisitScope,
        visitor_id: Option<&str>,
        timestamp: DateTime<Utc>,
        user_agent: String,
        referrer: String,
    ) -> Self {
        Self::Session(SessionEvent {
            session_id: scope.session_id.clone(),
            owner_code: scope.owner_code.clone(),
            share_code: scope.share_code.clone(),
            contact_id: scope.contact_id.clone(),
            visitor_id: visitor_id.map(str::to_string),
            timestamp,
            user_agent,
            referrer,
        })
    }

    pub fn page_view(scope: &VisitScope, page_type: &str, timestamp: DateTime<Utc>) -> Self {
        Self::PageView(PageViewEvent {
            session_id: scope.session_id.clone(),
            owner_code: scope.owner_code.clone(),
            share_code: scope.share_code.clone(),
            contact_id: scope.contact_id.clone(),
            page_type: page_type.to_string(),
            timestamp,
        })
    }

    /// Build a click event, deriving its category from the target
    pub fn click(scope: &VisitScope, click_target: &str, timestamp: DateTime<Utc>) -> Self {
        Self::Click(ClickEvent {
            session_id: scope.session_id.clone(),
            owner_code: scope.owner_code.clone(),
            share_code: scope.share_code.clone(),
            contact_id: scope.contact_id.clone(),
            click_target: click_target.to_string(),
            click_category: ClickCategory::from_target(click_target),
            timestamp,
        })
    }
}

/// An event waiting in the batcher queue.
///
/// Only the inner event goes over the wire; `enqueued_at` is kept for
/// diagnostics such as batch age.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchedEvent {
    #[serde(flatten)]
    pub event: AnalyticsEvent,
    #[serde(skip)]
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl BatchedEvent {
    pub fn new(event: AnalyticsEvent, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            event,
            enqueued_at: Some(enqueued_at),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}
