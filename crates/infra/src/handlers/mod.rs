//! Job handlers: one per queue.

pub mod feed;
pub mod notification;
pub mod summary;

pub use feed::{FeedError, FeedIngestionHandler, FeedItem, FeedSource, StaticFeedSource};
pub use notification::{LogNotifier, Notification, NotificationHandler, Notifier, NotifyError};
pub use summary::SummaryJobHandler;
