use crate::time::rfc3339_from_unix_ms;
use crate::{AppState, PhaseId};

#[derive(Debug, thiserror::Error, Clone, Eq, PartialEq)]
pub enum StateError {
    #[error("session document is not valid JSON: {0}")]
    Syntax(String),
    #[error("session document must be a JSON object")]
    NotAnObject,
    #[error("session document is missing `{0}`")]
    MissingField(&'static str),
    #[error("session document has an invalid shape: {0}")]
    Shape(String),
    #[error("expected exactly four phases P1..P4, found {0}")]
    PhaseCount(usize),
    #[error("phase {0} appears more than once")]
    DuplicatePhase(&'static str),
}

/// Validates and decodes a stored or imported session document.
///
/// The presence of `meta` and `phases` is checked on the raw JSON before typed
/// decoding so the error names the missing key. Phases come back in P1..P4 order.
pub fn parse_app_state(text: &str) -> Result<AppState, StateError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|err| StateError::Syntax(err.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(StateError::NotAnObject);
    };
    for key in ["meta", "phases"] {
        if !object.contains_key(key) {
            return Err(StateError::MissingField(key));
        }
    }

    let mut state: AppState =
        serde_json::from_value(value).map_err(|err| StateError::Shape(err.to_string()))?;

    if state.phases.len() != PhaseId::ALL.len() {
        return Err(StateError::PhaseCount(state.phases.len()));
    }
    state.phases.sort_by_key(|p| p.id);
    for pair in state.phases.windows(2) {
        if pair[0].id == pair[1].id {
            return Err(StateError::DuplicatePhase(pair[0].id.as_str()));
        }
    }

    Ok(state)
}

pub fn export_json(state: &AppState) -> String {
    serde_json::to_string_pretty(state).unwrap_or_default()
}

/// `crisis-session-2024-03-01T09-30-00.123Z.json`; colons are not portable in file names.
pub fn export_file_name(unix_ms: u64) -> String {
    let stamp = rfc3339_from_unix_ms(unix_ms).replace(':', "-");
    format!("crisis-session-{stamp}.json")
}

/// Replaces `current` with the imported document. On error `current` is untouched.
pub fn import_json(current: &mut AppState, text: &str) -> Result<(), StateError> {
    let imported = parse_app_state(text)?;
    *current = imported;
    Ok(())
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoadSource {
    Stored,
    Missing,
    FetchFailed(String),
    Invalid(StateError),
}

#[derive(Clone, Debug)]
pub struct LoadOutcome {
    pub state: AppState,
    pub source: LoadSource,
}

impl LoadOutcome {
    /// An invalid stored document is overwritten with the default right away.
    pub fn needs_resave(&self) -> bool {
        matches!(self.source, LoadSource::Invalid(_))
    }
}

/// Maps a raw fetch result to the state a caller should use. Never fails.
pub fn resolve_loaded(fetched: Result<Option<String>, String>, now: &str) -> LoadOutcome {
    let source = match fetched {
        Ok(Some(text)) => match parse_app_state(&text) {
            Ok(state) => {
                return LoadOutcome {
                    state,
                    source: LoadSource::Stored,
                };
            }
            Err(err) => LoadSource::Invalid(err),
        },
        Ok(None) => LoadSource::Missing,
        Err(message) => LoadSource::FetchFailed(message),
    };
    LoadOutcome {
        state: AppState::default_session(now),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, ChecklistKind, RidaKind};

    const NOW: &str = "2024-01-01T00:00:00Z";

    fn populated() -> AppState {
        let mut state = AppState::default_session(NOW);
        state.apply(Action::AddChecklistItem {
            phase: PhaseId::P2,
            list: ChecklistKind::Operational,
            text: "Check backups".to_owned(),
        });
        state.apply(Action::AddJournalEntry {
            kind: RidaKind::Decision,
            text: "Go to level 2".to_owned(),
            author: Some("Kim".to_owned()),
        });
        state
    }

    #[test]
    fn export_then_import_is_deep_equal() {
        let original = populated();
        let exported = export_json(&original);
        assert!(exported.contains("\n  \"meta\""));

        let mut target = AppState::default_session("2000-01-01T00:00:00Z");
        import_json(&mut target, &exported).expect("import succeeds");
        assert_eq!(target, original);
    }

    #[test]
    fn import_missing_phases_leaves_state_untouched() {
        let mut current = populated();
        let before = current.clone();

        let mut doc: serde_json::Value = serde_json::from_str(&export_json(&current)).unwrap();
        doc.as_object_mut().unwrap().remove("phases");

        let err = import_json(&mut current, &doc.to_string()).expect_err("must reject");
        assert_eq!(err, StateError::MissingField("phases"));
        assert_eq!(current, before);
    }

    #[test]
    fn phase_invariant_is_enforced() {
        let mut doc: serde_json::Value =
            serde_json::from_str(&export_json(&AppState::default_session(NOW))).unwrap();
        doc["phases"].as_array_mut().unwrap().pop();
        assert_eq!(
            parse_app_state(&doc.to_string()),
            Err(StateError::PhaseCount(3))
        );

        doc["phases"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({"id": "P1", "name": "again"}));
        assert_eq!(
            parse_app_state(&doc.to_string()),
            Err(StateError::DuplicatePhase("P1"))
        );
    }

    #[test]
    fn phases_are_normalized_to_canonical_order() {
        let mut doc: serde_json::Value =
            serde_json::from_str(&export_json(&AppState::default_session(NOW))).unwrap();
        doc["phases"].as_array_mut().unwrap().reverse();
        let state = parse_app_state(&doc.to_string()).unwrap();
        assert_eq!(
            state.phases.iter().map(|p| p.id).collect::<Vec<_>>(),
            PhaseId::ALL.to_vec()
        );
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let mut doc: serde_json::Value =
            serde_json::from_str(&export_json(&AppState::default_session(NOW))).unwrap();
        doc["meta"]["severity"] = serde_json::json!("apocalyptic");
        assert!(matches!(
            parse_app_state(&doc.to_string()),
            Err(StateError::Shape(_))
        ));
        assert_eq!(parse_app_state("[1,2]"), Err(StateError::NotAnObject));
        assert!(matches!(
            parse_app_state("{nope"),
            Err(StateError::Syntax(_))
        ));
    }

    #[test]
    fn resolve_loaded_falls_back_to_default() {
        let missing = resolve_loaded(Ok(None), NOW);
        assert_eq!(missing.source, LoadSource::Missing);
        assert_eq!(missing.state, AppState::default_session(NOW));
        assert!(!missing.needs_resave());

        let failed = resolve_loaded(Err("connection refused".to_owned()), NOW);
        assert_eq!(
            failed.source,
            LoadSource::FetchFailed("connection refused".to_owned())
        );

        let invalid = resolve_loaded(Ok(Some("{\"meta\":{}}".to_owned())), NOW);
        assert!(invalid.needs_resave());
        assert_eq!(invalid.state, AppState::default_session(NOW));

        let stored = resolve_loaded(Ok(Some(export_json(&populated()))), NOW);
        assert_eq!(stored.source, LoadSource::Stored);
        assert_eq!(stored.state.journal.len(), 1);
    }

    #[test]
    fn export_file_name_embeds_timestamp() {
        assert_eq!(
            export_file_name(1_700_000_000_000),
            "crisis-session-2023-11-14T22-13-20Z.json"
        );
    }
}
