use crate::{
    ActionStatus, ChecklistKind, Contact, CrisisMode, PhaseId, RidaKind, Severity,
};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MetaPatch {
    pub title: Option<String>,
    pub mode: Option<CrisisMode>,
    pub severity: Option<Severity>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChecklistItemPatch {
    pub text: Option<String>,
    /// `Some(None)` clears the assignee.
    pub assignee: Option<Option<String>>,
    pub due_at: Option<Option<String>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    UpdateMeta(MetaPatch),

    AddContact {
        contact: Contact,
    },
    UpdateContact {
        contact: Contact,
    },
    RemoveContact {
        contact_id: String,
    },

    AddJournalEntry {
        kind: RidaKind,
        text: String,
        author: Option<String>,
    },
    RemoveJournalEntry {
        entry_id: String,
    },

    AddAction {
        title: String,
        owner: Option<String>,
        due_at: Option<String>,
    },
    SetActionStatus {
        action_id: String,
        status: ActionStatus,
    },
    RemoveAction {
        action_id: String,
    },

    AddDecision {
        title: String,
        rationale: Option<String>,
        decided_by: Option<String>,
    },
    RemoveDecision {
        decision_id: String,
    },

    AddCommunication {
        audience: String,
        channel: Option<String>,
        message: String,
    },
    MarkCommunicationSent {
        communication_id: String,
    },
    RemoveCommunication {
        communication_id: String,
    },

    AddChecklistItem {
        phase: PhaseId,
        list: ChecklistKind,
        text: String,
    },
    EditChecklistItem {
        phase: PhaseId,
        list: ChecklistKind,
        item_id: String,
        patch: ChecklistItemPatch,
    },
    ToggleChecklistItem {
        phase: PhaseId,
        list: ChecklistKind,
        item_id: String,
    },
    RemoveChecklistItem {
        phase: PhaseId,
        list: ChecklistKind,
        item_id: String,
    },
}
