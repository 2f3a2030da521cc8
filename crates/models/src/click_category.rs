use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use ts_rs::TS;

/// Coarse classification of a click target, used for aggregation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, EnumString, Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ClickCategory {
    Contact,
    Messaging,
    Social,
    Portfolio,
    AiAgent,
    Other,
}

impl ClickCategory {
    /// Derive the category from a dotted click target such as `contact.phone`
    pub fn from_target(target: &str) -> Self {
        const PREFIXES: [(&str, ClickCategory); 4] = [
            ("contact.", ClickCategory::Contact),
            ("socialMessaging.", ClickCategory::Messaging),
            ("socialChannels.", ClickCategory::Social),
            ("portfolio.", ClickCategory::Portfolio),
        ];

        if target == "aiAgent" {
            return Self::AiAgent;
        }

        PREFIXES
            .iter()
            .find(|(prefix, _)| target.starts_with(prefix))
            .map(|(_, category)| *category)
            .unwrap_or(Self::Other)
    }
}
