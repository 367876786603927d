use serde::{Deserialize, Serialize};

mod phase;
pub use phase::{ChecklistItem, ChecklistKind, Phase, PhaseId};

/// The whole tracked session. Every save transmits this object in full.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub meta: Meta,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub journal: Vec<JournalEntry>,
    #[serde(default)]
    pub actions: Vec<ActionItem>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub communications: Vec<Communication>,
    pub phases: Vec<Phase>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub title: String,
    #[serde(default)]
    pub mode: CrisisMode,
    #[serde(default)]
    pub severity: Severity,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub version: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisMode {
    #[default]
    Exercise,
    Real,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Kind of a RIDA log record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RidaKind {
    Information,
    Decision,
    Action,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub kind: RidaKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub decided_at: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStatus {
    #[default]
    Draft,
    Sent,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Communication {
    pub id: String,
    pub audience: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub message: String,
    #[serde(default)]
    pub status: CommunicationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
}

impl AppState {
    pub const DEFAULT_TITLE: &'static str = "Crisis session";

    pub fn default_session(now: &str) -> Self {
        Self {
            meta: Meta {
                title: Self::DEFAULT_TITLE.to_owned(),
                mode: CrisisMode::Exercise,
                severity: Severity::Moderate,
                created_at: now.to_owned(),
                updated_at: now.to_owned(),
                version: 0,
            },
            contacts: Vec::new(),
            journal: Vec::new(),
            actions: Vec::new(),
            decisions: Vec::new(),
            communications: Vec::new(),
            phases: PhaseId::ALL.into_iter().map(Phase::empty).collect(),
        }
    }

    pub fn phase(&self, id: PhaseId) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub(crate) fn phase_mut(&mut self, id: PhaseId) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == id)
    }

    /// Canonical serialized form, used for change detection.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_has_four_empty_phases() {
        let state = AppState::default_session("2024-01-01T00:00:00Z");
        assert_eq!(state.meta.severity, Severity::Moderate);
        assert_eq!(state.meta.mode, CrisisMode::Exercise);
        assert_eq!(state.meta.version, 0);
        assert_eq!(
            state.phases.iter().map(|p| p.id).collect::<Vec<_>>(),
            PhaseId::ALL.to_vec()
        );
        for phase in &state.phases {
            assert!(phase.strategic.is_empty());
            assert!(phase.operational.is_empty());
        }
        assert!(state.journal.is_empty());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let state = AppState::default_session("2024-01-01T00:00:00Z");
        let value: serde_json::Value = serde_json::from_str(&state.to_json()).unwrap();
        assert_eq!(value["meta"]["createdAt"], "2024-01-01T00:00:00Z");
        assert_eq!(value["meta"]["severity"], "moderate");
        assert_eq!(value["phases"][0]["id"], "P1");
        assert_eq!(value["phases"][3]["name"], "Capitalize");
        assert!(value["contacts"].as_array().unwrap().is_empty());
    }
}
