//! Capabilities the batcher needs from whatever hosts it.

use chrono::{DateTime, Utc};

/// Source of event timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// User agent and referrer of the visitor, stamped onto session events
pub trait ClientEnvironment: Send + Sync {
    fn user_agent(&self) -> String;
    fn referrer(&self) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct StaticClientEnvironment {
    user_agent: String,
    referrer: String,
}

impl StaticClientEnvironment {
    pub fn new(user_agent: impl Into<String>, referrer: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            referrer: referrer.into(),
        }
    }
}

impl ClientEnvironment for StaticClientEnvironment {
    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn referrer(&self) -> String {
        self.referrer.clone()
    }
}

/// Page lifecycle signals delivered by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLifecycle {
    Visible,
    /// The page went to the background; it may never come back
    Hidden,
    /// The page is being torn down
    Unload,
}
