use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum PhaseId {
    P1,
    P2,
    P3,
    P4,
}

impl PhaseId {
    pub const ALL: [PhaseId; 4] = [PhaseId::P1, PhaseId::P2, PhaseId::P3, PhaseId::P4];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
            Self::P4 => "P4",
        }
    }

    pub fn default_name(self) -> &'static str {
        match self {
            Self::P1 => "Mobilize",
            Self::P2 => "Maintain trust",
            Self::P3 => "Recover",
            Self::P4 => "Capitalize",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistKind {
    Strategic,
    Operational,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: PhaseId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub strategic: Vec<ChecklistItem>,
    #[serde(default)]
    pub operational: Vec<ChecklistItem>,
}

impl Phase {
    pub fn empty(id: PhaseId) -> Self {
        Self {
            id,
            name: id.default_name().to_owned(),
            strategic: Vec::new(),
            operational: Vec::new(),
        }
    }

    pub fn list(&self, kind: ChecklistKind) -> &[ChecklistItem] {
        match kind {
            ChecklistKind::Strategic => &self.strategic,
            ChecklistKind::Operational => &self.operational,
        }
    }

    pub(crate) fn list_mut(&mut self, kind: ChecklistKind) -> &mut Vec<ChecklistItem> {
        match kind {
            ChecklistKind::Strategic => &mut self.strategic,
            ChecklistKind::Operational => &mut self.operational,
        }
    }
}
