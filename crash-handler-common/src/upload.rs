//! The upload scheduler interface.

use std::time::Duration;

use uuid::Uuid;

/// Transmits finalized reports in the background.
pub trait UploadScheduler: Send + Sync {
    /// Queue `report_id` for upload. Never blocks on the upload itself.
    fn report_pending(&self, report_id: Uuid);

    /// Block until all queued uploads have been attempted, or `timeout` elapses.
    ///
    /// Returns `false` on timeout.
    fn wait_for_pending_upload(&self, timeout: Duration) -> bool;
}
