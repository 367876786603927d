use crate::time::now_rfc3339;
use crate::{
    Action, ActionItem, AppState, ChecklistItem, ChecklistKind, Communication,
    CommunicationStatus, Decision, Effect, JournalEntry, PhaseId, new_item_id,
};

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn changed(did_change: bool) -> Vec<Effect> {
    if did_change {
        vec![Effect::SaveState]
    } else {
        Vec::new()
    }
}

fn remove_by_id<T>(items: &mut Vec<T>, id: &str, get_id: impl Fn(&T) -> &str) -> bool {
    let before = items.len();
    items.retain(|item| get_id(item) != id);
    items.len() != before
}

impl AppState {
    pub fn apply(&mut self, action: Action) -> Vec<Effect> {
        match action {
            Action::UpdateMeta(patch) => {
                let mut did_change = false;
                if let Some(title) = patch.title.as_deref().and_then(non_empty)
                    && title != self.meta.title
                {
                    self.meta.title = title;
                    did_change = true;
                }
                if let Some(mode) = patch.mode
                    && mode != self.meta.mode
                {
                    self.meta.mode = mode;
                    did_change = true;
                }
                if let Some(severity) = patch.severity
                    && severity != self.meta.severity
                {
                    self.meta.severity = severity;
                    did_change = true;
                }
                changed(did_change)
            }

            Action::AddContact { mut contact } => {
                let Some(name) = non_empty(&contact.name) else {
                    return Vec::new();
                };
                contact.name = name;
                if contact.id.trim().is_empty() || self.contacts.iter().any(|c| c.id == contact.id)
                {
                    contact.id = new_item_id();
                }
                self.contacts.push(contact);
                vec![Effect::SaveState]
            }
            Action::UpdateContact { contact } => {
                let Some(existing) = self.contacts.iter_mut().find(|c| c.id == contact.id) else {
                    return Vec::new();
                };
                if *existing == contact {
                    return Vec::new();
                }
                *existing = contact;
                vec![Effect::SaveState]
            }
            Action::RemoveContact { contact_id } => {
                changed(remove_by_id(&mut self.contacts, &contact_id, |c| &c.id))
            }

            Action::AddJournalEntry { kind, text, author } => {
                let Some(text) = non_empty(&text) else {
                    return Vec::new();
                };
                self.journal.push(JournalEntry {
                    id: new_item_id(),
                    kind,
                    text,
                    author: author.as_deref().and_then(non_empty),
                    timestamp: now_rfc3339(),
                });
                vec![Effect::SaveState]
            }
            Action::RemoveJournalEntry { entry_id } => {
                changed(remove_by_id(&mut self.journal, &entry_id, |e| &e.id))
            }

            Action::AddAction {
                title,
                owner,
                due_at,
            } => {
                let Some(title) = non_empty(&title) else {
                    return Vec::new();
                };
                self.actions.push(ActionItem {
                    id: new_item_id(),
                    title,
                    owner: owner.as_deref().and_then(non_empty),
                    status: Default::default(),
                    due_at: due_at.as_deref().and_then(non_empty),
                    created_at: now_rfc3339(),
                });
                vec![Effect::SaveState]
            }
            Action::SetActionStatus { action_id, status } => {
                match self.actions.iter_mut().find(|a| a.id == action_id) {
                    Some(item) if item.status != status => {
                        item.status = status;
                        vec![Effect::SaveState]
                    }
                    _ => Vec::new(),
                }
            }
            Action::RemoveAction { action_id } => {
                changed(remove_by_id(&mut self.actions, &action_id, |a| &a.id))
            }

            Action::AddDecision {
                title,
                rationale,
                decided_by,
            } => {
                let Some(title) = non_empty(&title) else {
                    return Vec::new();
                };
                self.decisions.push(Decision {
                    id: new_item_id(),
                    title,
                    rationale: rationale.as_deref().and_then(non_empty),
                    decided_by: decided_by.as_deref().and_then(non_empty),
                    decided_at: now_rfc3339(),
                });
                vec![Effect::SaveState]
            }
            Action::RemoveDecision { decision_id } => {
                changed(remove_by_id(&mut self.decisions, &decision_id, |d| &d.id))
            }

            Action::AddCommunication {
                audience,
                channel,
                message,
            } => {
                let (Some(audience), Some(message)) = (non_empty(&audience), non_empty(&message))
                else {
                    return Vec::new();
                };
                self.communications.push(Communication {
                    id: new_item_id(),
                    audience,
                    channel: channel.as_deref().and_then(non_empty),
                    message,
                    status: CommunicationStatus::Draft,
                    sent_at: None,
                });
                vec![Effect::SaveState]
            }
            Action::MarkCommunicationSent { communication_id } => {
                match self
                    .communications
                    .iter_mut()
                    .find(|c| c.id == communication_id)
                {
                    Some(comm) if comm.status != CommunicationStatus::Sent => {
                        comm.status = CommunicationStatus::Sent;
                        comm.sent_at = Some(now_rfc3339());
                        vec![Effect::SaveState]
                    }
                    _ => Vec::new(),
                }
            }
            Action::RemoveCommunication { communication_id } => changed(remove_by_id(
                &mut self.communications,
                &communication_id,
                |c| &c.id,
            )),

            Action::AddChecklistItem { phase, list, text } => {
                let Some(text) = non_empty(&text) else {
                    return Vec::new();
                };
                let Some(items) = self.checklist_mut(phase, list) else {
                    return Vec::new();
                };
                items.push(ChecklistItem {
                    id: new_item_id(),
                    text,
                    checked: false,
                    assignee: None,
                    due_at: None,
                });
                vec![Effect::SaveState]
            }
            Action::EditChecklistItem {
                phase,
                list,
                item_id,
                patch,
            } => {
                let Some(item) = self.checklist_item_mut(phase, list, &item_id) else {
                    return Vec::new();
                };
                let before = item.clone();
                if let Some(text) = patch.text.as_deref().and_then(non_empty) {
                    item.text = text;
                }
                if let Some(assignee) = patch.assignee {
                    item.assignee = assignee.as_deref().and_then(non_empty);
                }
                if let Some(due_at) = patch.due_at {
                    item.due_at = due_at.as_deref().and_then(non_empty);
                }
                changed(*item != before)
            }
            Action::ToggleChecklistItem {
                phase,
                list,
                item_id,
            } => {
                let Some(item) = self.checklist_item_mut(phase, list, &item_id) else {
                    return Vec::new();
                };
                item.checked = !item.checked;
                vec![Effect::SaveState]
            }
            Action::RemoveChecklistItem {
                phase,
                list,
                item_id,
            } => {
                let Some(items) = self.checklist_mut(phase, list) else {
                    return Vec::new();
                };
                changed(remove_by_id(items, &item_id, |i| &i.id))
            }
        }
    }

    fn checklist_mut(
        &mut self,
        phase: PhaseId,
        list: ChecklistKind,
    ) -> Option<&mut Vec<ChecklistItem>> {
        self.phase_mut(phase).map(|p| p.list_mut(list))
    }

    fn checklist_item_mut(
        &mut self,
        phase: PhaseId,
        list: ChecklistKind,
        item_id: &str,
    ) -> Option<&mut ChecklistItem> {
        self.checklist_mut(phase, list)?
            .iter_mut()
            .find(|item| item.id == item_id)
    }
}
