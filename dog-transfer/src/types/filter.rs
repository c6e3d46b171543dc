use std::path::PathBuf;

use super::{Direction, TransferRecord, TransferState};

/// Selects live transfers for the bulk operations on the engine.
///
/// Every field left unset matches anything; set fields must all match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferFilter {
    pub direction: Option<Direction>,
    pub container: Option<String>,
    pub blob: Option<String>,
    pub local: Option<PathBuf>,
    pub state: Option<TransferState>,
}

impl TransferFilter {
    /// Match every transfer
    pub fn all() -> Self {
        Self::default()
    }

    pub fn downloads() -> Self {
        Self::all().with_direction(Direction::Download)
    }

    pub fn uploads() -> Self {
        Self::all().with_direction(Direction::Upload)
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_blob(mut self, blob: impl Into<String>) -> Self {
        self.blob = Some(blob.into());
        self
    }

    /// Download target or upload source
    pub fn with_local(mut self, local: impl Into<PathBuf>) -> Self {
        self.local = Some(local.into());
        self
    }

    pub fn with_state(mut self, state: TransferState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, record: &TransferRecord) -> bool {
        let direction_ok = self.direction.map_or(true, |d| d == record.direction);
        let container_ok = self.container.as_ref().map_or(true, |c| c == &record.remote.container);
        let blob_ok = self.blob.as_ref().map_or(true, |b| b == &record.remote.blob);
        let local_ok = self.local.as_ref().map_or(true, |l| l == &record.local);
        let state_ok = self.state.map_or(true, |s| s == record.state);
        direction_ok && container_ok && blob_ok && local_ok && state_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RemoteRef, RestorationId};

    fn upload(container: &str, blob: &str) -> TransferRecord {
        TransferRecord::new(
            Direction::Upload,
            RemoteRef::new(container, blob),
            PathBuf::from(format!("/tmp/{}", blob)),
            Some(10),
            RestorationId::default(),
            4,
            0,
            chrono::Utc::now(),
        )
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(TransferFilter::all().matches(&upload("media", "a.wav")));
    }

    #[test]
    fn test_all_set_fields_must_match() {
        let record = upload("media", "a.wav");

        assert!(TransferFilter::uploads().with_container("media").matches(&record));
        assert!(TransferFilter::all().with_local("/tmp/a.wav").matches(&record));
        assert!(!TransferFilter::downloads().with_container("media").matches(&record));
        assert!(!TransferFilter::uploads().with_container("media").with_blob("b.wav").matches(&record));
        assert!(!TransferFilter::all().with_state(TransferState::Complete).matches(&record));
    }
}
