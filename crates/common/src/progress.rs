//! Progress callback trait used by transfer displays.
//!
//! The payload type is generic so the storage crate can hand out its own
//! snapshot type without this crate knowing about transfers.

use std::sync::Arc;

/// Receives periodic progress payloads.
///
/// # Returns
/// Implementations return `true` to keep the operation going and `false` to
/// ask for it to be cancelled.
pub trait ProgressCallback<T>: Send + Sync {
    /// Called with progress updates.
    ///
    /// # Arguments
    /// * `progress` - Progress data for the current operation
    fn on_progress(&self, progress: &T) -> bool;
}

impl<T, P> ProgressCallback<T> for Arc<P>
where
    P: ProgressCallback<T> + ?Sized,
{
    fn on_progress(&self, progress: &T) -> bool {
        (**self).on_progress(progress)
    }
}
