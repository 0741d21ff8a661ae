//! Reload bookkeeping kept in the session store

use chrono::{DateTime, Local, Utc};

use crate::error::Result;
use crate::storage::KeyValueStore;

pub const TRIGGERED_KEY: &str = "vaadin.live-reload.triggered";
pub const TRIGGERED_COUNT_KEY: &str = "vaadin.live-reload.triggeredCount";

/// "Page reloaded at HH:MM:SS" notice shown once after a live reload
pub struct ReloadNotice;

impl ReloadNotice {
    /// Record that a reload was triggered now and return the running count
    pub fn record(session: &KeyValueStore) -> Result<u32> {
        let count = Self::count(session)? + 1;
        session.set(TRIGGERED_KEY, &Utc::now().to_rfc3339())?;
        session.set(TRIGGERED_COUNT_KEY, &count.to_string())?;
        Ok(count)
    }

    /// Number of reloads triggered in this session
    pub fn count(session: &KeyValueStore) -> Result<u32> {
        Ok(session
            .get(TRIGGERED_COUNT_KEY)?
            .and_then(|count| count.parse().ok())
            .unwrap_or(0))
    }

    /// Consume the pending notice, if a reload was recorded
    pub fn take(session: &KeyValueStore) -> Result<Option<String>> {
        let Some(triggered) = session.get(TRIGGERED_KEY)? else {
            return Ok(None);
        };
        session.remove(TRIGGERED_KEY)?;

        let at = DateTime::parse_from_rfc3339(&triggered)
            .map(|t| t.with_timezone(&Local))
            .unwrap_or_else(|_| Local::now());
        Ok(Some(format!("Page reloaded at {}", at.format("%H:%M:%S"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ClientStorage;

    #[test]
    fn test_notice_is_shown_once() {
        let storage = ClientStorage::temporary().unwrap();
        let session = storage.session().unwrap();

        assert!(ReloadNotice::take(&session).unwrap().is_none());

        ReloadNotice::record(&session).unwrap();
        let notice = ReloadNotice::take(&session).unwrap().unwrap();
        assert!(notice.starts_with("Page reloaded at "));
        assert_eq!(notice.len(), "Page reloaded at 00:00:00".len());

        assert!(ReloadNotice::take(&session).unwrap().is_none());
    }

    #[test]
    fn test_count_accumulates() {
        let storage = ClientStorage::temporary().unwrap();
        let session = storage.session().unwrap();

        assert_eq!(ReloadNotice::record(&session).unwrap(), 1);
        assert_eq!(ReloadNotice::record(&session).unwrap(), 2);
        ReloadNotice::take(&session).unwrap();
        assert_eq!(ReloadNotice::count(&session).unwrap(), 2);
    }
}
