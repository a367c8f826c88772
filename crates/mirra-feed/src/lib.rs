//! Upstream change-feed consumption.
//!
//! Heterogeneous "what changed" APIs are normalized into one capability
//! contract: resolve an initial cursor, then fetch finite lazy pages of
//! `(sequence, fullname)` records. The [`subscription`] module drives the
//! feed in a loop, routes each change through the deployment's
//! scope/registry ownership rules and spawns reconciliation tasks.

pub mod cnpmcore;
pub mod cnpmjson;
pub mod decoder;
pub mod error;
pub mod feed;
pub mod npm;
pub mod pipe;
pub mod subscription;

pub use error::{FeedError, Result};
pub use feed::{feed_for, ChangeFeed, ChangePage, ChangeRecord};
pub use subscription::{execute_changes_task, needs_sync, SubscriptionContext, SubscriptionMode};
