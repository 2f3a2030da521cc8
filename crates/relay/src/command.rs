//! Input lines accepted by the relay.

use models::analytics_event::VisitScope;
use serde::Deserialize;
use services::services::host::PageLifecycle;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScopeInput {
    /// Falls back to the relay's per-run session id
    #[serde(default)]
    pub session_id: Option<String>,
    pub owner_code: String,
    pub share_code: String,
    #[serde(default)]
    pub contact_id: Option<String>,
}

impl ScopeInput {
    pub fn into_scope(self, default_session: &str) -> VisitScope {
        VisitScope {
            session_id: self
                .session_id
                .unwrap_or_else(|| default_session.to_string()),
            owner_code: self.owner_code,
            share_code: self.share_code,
            contact_id: self.contact_id,
        }
    }
}

/// One JSON line on stdin, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayCommand {
    Session {
        #[serde(flatten)]
        scope: ScopeInput,
        #[serde(default)]
        visitor_id: Option<String>,
    },
    PageView {
        #[serde(flatten)]
        scope: ScopeInput,
        page_type: String,
    },
    Click {
        #[serde(flatten)]
        scope: ScopeInput,
        click_target: String,
    },
    Visible,
    Hidden,
    Unload,
}

impl RelayCommand {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// The lifecycle signal this command stands for, if any
    pub fn lifecycle(&self) -> Option<PageLifecycle> {
        match self {
            Self::Visible => Some(PageLifecycle::Visible),
            Self::Hidden => Some(PageLifecycle::Hidden),
            Self::Unload => Some(PageLifecycle::Unload),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_click() {
        let command = RelayCommand::parse(
            r#"{"kind":"click","session_id":"s-1","owner_code":"AB12CD","share_code":"public","click_target":"contact.phone"}"#,
        )
        .unwrap();

        assert_eq!(
            command,
            RelayCommand::Click {
                scope: ScopeInput {
                    session_id: Some("s-1".to_string()),
                    owner_code: "AB12CD".to_string(),
                    share_code: "public".to_string(),
                    contact_id: None,
                },
                click_target: "contact.phone".to_string(),
            }
        );
        assert_eq!(command.lifecycle(), None);
    }

    #[test]
    fn test_parse_session_uses_default_session_id() {
        let command = RelayCommand::parse(
            r#"{"kind":"session","owner_code":"AB12CD","share_code":"team","contact_id":"c-2","visitor_id":"v-1"}"#,
        )
        .unwrap();

        let RelayCommand::Session { scope, visitor_id } = command else {
            panic!("expected session command");
        };
        assert_eq!(visitor_id.as_deref(), Some("v-1"));

        let scope = scope.into_scope("run-session");
        assert_eq!(scope.session_id, "run-session");
        assert_eq!(scope.contact_id.as_deref(), Some("c-2"));
    }

    #[test]
    fn test_parse_lifecycle() {
        assert_eq!(
            RelayCommand::parse(r#"{"kind":"hidden"}"#)
                .unwrap()
                .lifecycle(),
            Some(PageLifecycle::Hidden)
        );
        assert_eq!(
            RelayCommand::parse(r#"{"kind":"unload"}"#)
                .unwrap()
                .lifecycle(),
            Some(PageLifecycle::Unload)
        );
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(RelayCommand::parse(r#"{"kind":"scroll"}"#).is_err());
        assert!(RelayCommand::parse(r#"{"kind":"page_view","owner_code":"x"}"#).is_err());
        assert!(RelayCommand::parse("not json").is_err());
    }
}
