mod ids;
pub use ids::{SESSION_ID_MAX_LEN, SessionId, new_item_id};

mod state;
pub use state::{
    ActionItem, ActionStatus, AppState, ChecklistItem, ChecklistKind, Communication,
    CommunicationStatus, Contact, CrisisMode, Decision, JournalEntry, Meta, Phase, PhaseId,
    RidaKind, Severity,
};

mod actions;
pub use actions::{Action, ChecklistItemPatch, MetaPatch};
mod effects;
pub use effects::Effect;
mod reducer;

mod persistence;
pub use persistence::{
    LoadOutcome, LoadSource, StateError, export_file_name, export_json, import_json,
    parse_app_state, resolve_loaded,
};

mod timeline;
pub use timeline::TimelineRecord;

mod adapters;
pub use adapters::{RESOURCE_MAX_BYTES, ResourceRef, ResourceUpload, SessionStore, StoredState};

mod offline;
pub use offline::{APP_STATE_TABLE, OperationKind, PendingOperation};

pub mod paths;
pub mod time;
