use crate::model::{CanonicalStatus, RawStatus};

/// Raw-to-canonical status vocabulary of one domain.
///
/// Implementations are plain lookups: no I/O, no state. Values the table does
/// not know return `None` and are classified by [`classify`] as an
/// unrecognized `Failed`.
pub trait StatusTable: Send + Sync {
    /// Short label used in logs and error messages, e.g. `"qlik-sense task"`.
    fn domain(&self) -> &'static str;

    fn lookup(&self, raw: &RawStatus) -> Option<CanonicalStatus>;
}

/// Canonical status plus whether the raw value was in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status: CanonicalStatus,
    pub recognized: bool,
}

/// Total classification: unknown raw values become an unrecognized `Failed`.
pub fn classify(table: &dyn StatusTable, raw: &RawStatus) -> Classification {
    match table.lookup(raw) {
        Some(status) => Classification {
            status,
            recognized: true,
        },
        None => Classification {
            status: CanonicalStatus::Failed,
            recognized: false,
        },
    }
}
