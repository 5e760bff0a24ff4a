//! Subscriber demand.
//!
//! Consumers subscribe per topic, optionally to a subset of fields and
//! optionally asking for the whole topic to be preloaded. The player only
//! ever sees the merged demand:
//!
//! ```ignore
//! let merged = merge_subscriptions(&subscriptions);
//! player.set_subscriptions(merged);
//!
//! // Later, when a batch arrives:
//! let index = SubscriberIndex::build(&subscriptions);
//! let buckets = index.bucket(&state_messages, subscriptions.keys());
//! ```

mod index;
mod merge;

pub use index::SubscriberIndex;
pub use merge::{merge_payloads, merge_subscriptions};
