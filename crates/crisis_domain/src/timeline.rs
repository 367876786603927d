use crate::time::unix_ms_from_rfc3339;
use crate::{AppState, RidaKind};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRecord {
    pub kind: RidaKind,
    pub id: String,
    pub at: String,
    pub text: String,
}

impl AppState {
    /// Journal entries, decisions and actions merged into one RIDA log, oldest first.
    ///
    /// Records whose timestamp does not parse sort first. Ties keep journal, then
    /// decision, then action order.
    pub fn rida_timeline(&self) -> Vec<TimelineRecord> {
        let journal = self.journal.iter().map(|entry| TimelineRecord {
            kind: entry.kind,
            id: entry.id.clone(),
            at: entry.timestamp.clone(),
            text: entry.text.clone(),
        });
        let decisions = self.decisions.iter().map(|decision| TimelineRecord {
            kind: RidaKind::Decision,
            id: decision.id.clone(),
            at: decision.decided_at.clone(),
            text: match &decision.rationale {
                Some(rationale) => format!("{}: {rationale}", decision.title),
                None => decision.title.clone(),
            },
        });
        let actions = self.actions.iter().map(|action| TimelineRecord {
            kind: RidaKind::Action,
            id: action.id.clone(),
            at: action.created_at.clone(),
            text: action.title.clone(),
        });

        let mut records: Vec<(u64, TimelineRecord)> = journal
            .chain(decisions)
            .chain(actions)
            .map(|record| (unix_ms_from_rfc3339(&record.at).unwrap_or(0), record))
            .collect();
        records.sort_by_key(|(at, _)| *at);
        records.into_iter().map(|(_, record)| record).collect()
    }
}
