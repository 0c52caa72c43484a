//! Interactive confirm/notify seam. Only two core paths ask questions: the
//! retry-or-abort loop of an order-file move and the missing upstream number
//! during an archive install. Everything else only reports.

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

pub trait Prompt: Send + Sync {
    /// Yes/no question. `false` means abort.
    fn confirm(&self, title: &str, message: &str) -> bool;

    /// Ask for a number the core could not infer.
    fn request_number(&self, title: &str, message: &str) -> Option<i64>;

    /// User-visible message with no answer expected.
    fn notify(&self, level: NoticeLevel, message: &str);
}

/// Answers every question with "no" and routes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct Headless;

impl Prompt for Headless {
    fn confirm(&self, title: &str, message: &str) -> bool {
        info!(title, message, "confirmation declined (headless)");
        false
    }

    fn request_number(&self, title: &str, message: &str) -> Option<i64> {
        info!(title, message, "number request declined (headless)");
        None
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => info!("{message}"),
            NoticeLevel::Warn => warn!("{message}"),
            NoticeLevel::Error => error!("{message}"),
        }
    }
}
