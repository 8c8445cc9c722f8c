use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

/// Every outbound action the core may ask the gateway to perform.
///
/// The set is closed: an envelope naming anything else fails envelope
/// validation. Adding an action means adding a variant here and a catalog
/// entry in the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "email.fetch")]
    EmailFetch,
    #[serde(rename = "email.send")]
    EmailSend,
    #[serde(rename = "email.draft")]
    EmailDraft,
    #[serde(rename = "calendar.fetch")]
    CalendarFetch,
    #[serde(rename = "calendar.create")]
    CalendarCreate,
    #[serde(rename = "calendar.update")]
    CalendarUpdate,
    #[serde(rename = "finance.fetch_transactions")]
    FinanceFetchTransactions,
    #[serde(rename = "web.search")]
    WebSearch,
    #[serde(rename = "web.fetch")]
    WebFetch,
    #[serde(rename = "model.download")]
    ModelDownload,
    #[serde(rename = "service.api_call")]
    ServiceApiCall,
    #[serde(rename = "connector.auth")]
    ConnectorAuth,
    #[serde(rename = "connector.sync")]
    ConnectorSync,
    #[serde(rename = "reminder.create")]
    ReminderCreate,
}

impl ActionType {
    pub const ALL: [ActionType; 14] = [
        ActionType::EmailFetch,
        ActionType::EmailSend,
        ActionType::EmailDraft,
        ActionType::CalendarFetch,
        ActionType::CalendarCreate,
        ActionType::CalendarUpdate,
        ActionType::FinanceFetchTransactions,
        ActionType::WebSearch,
        ActionType::WebFetch,
        ActionType::ModelDownload,
        ActionType::ServiceApiCall,
        ActionType::ConnectorAuth,
        ActionType::ConnectorSync,
        ActionType::ReminderCreate,
    ];

    /// Wire name, e.g. `"web.fetch"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::EmailFetch => "email.fetch",
            ActionType::EmailSend => "email.send",
            ActionType::EmailDraft => "email.draft",
            ActionType::CalendarFetch => "calendar.fetch",
            ActionType::CalendarCreate => "calendar.create",
            ActionType::CalendarUpdate => "calendar.update",
            ActionType::FinanceFetchTransactions => "finance.fetch_transactions",
            ActionType::WebSearch => "web.search",
            ActionType::WebFetch => "web.fetch",
            ActionType::ModelDownload => "model.download",
            ActionType::ServiceApiCall => "service.api_call",
            ActionType::ConnectorAuth => "connector.auth",
            ActionType::ConnectorSync => "connector.sync",
            ActionType::ReminderCreate => "reminder.create",
        }
    }

    /// Action family, the part of the wire name before the dot.
    pub fn family(&self) -> &'static str {
        let name = self.as_str();
        match name.split_once('.') {
            Some((family, _)) => family,
            None => name,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownAction(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip_through_from_str() {
        for action in ActionType::ALL {
            assert_eq!(action.as_str().parse::<ActionType>().unwrap(), action);
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&ActionType::FinanceFetchTransactions).unwrap();
        assert_eq!(json, "\"finance.fetch_transactions\"");

        let parsed: ActionType = serde_json::from_str("\"web.fetch\"").unwrap();
        assert_eq!(parsed, ActionType::WebFetch);
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!("shell.exec".parse::<ActionType>().is_err());
        assert!(serde_json::from_str::<ActionType>("\"shell.exec\"").is_err());
    }

    #[test]
    fn family_is_prefix() {
        assert_eq!(ActionType::ConnectorSync.family(), "connector");
        assert_eq!(ActionType::WebFetch.family(), "web");
    }
}
