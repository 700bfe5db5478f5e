use tracing::{error, info, warn};

/// Where the pipeline reports progress and failures. Presentation is the
/// implementor's business.
pub trait Notifier: Send + Sync {
    fn information(&self, message: &str);

    /// `show_to_user` separates failures a user should see from ones that only
    /// belong in the log.
    fn technical_failure(&self, message: &str, show_to_user: bool);
}

/// Reports as `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn information(&self, message: &str) {
        info!("{message}");
    }

    fn technical_failure(&self, message: &str, show_to_user: bool) {
        if show_to_user {
            error!("{message}");
        } else {
            warn!("{message}");
        }
    }
}
