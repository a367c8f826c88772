//! The change-feed capability contract and adapter dispatch.

use mirra_config::{Registry, RegistryKind};

use crate::{
    cnpmcore::CnpmcoreFeed, cnpmjson::CnpmjsonFeed, error::Result, npm::NpmFeed,
};

/// How far an initial cursor is backed off from the upstream's current
/// position (sequence units or seconds, per kind) to tolerate minor
/// upstream lag.
pub(crate) const INITIAL_SINCE_BACKOFF: u64 = 10;

/// One observed change: a package and the cursor it advances the feed to.
/// Ephemeral — produced by an adapter, consumed immediately by the
/// subscription driver, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Opaque cursor value (integer sequence or millisecond timestamp).
    pub sequence: String,
    pub fullname: String,
}

/// One finite page of changes, yielded lazily.
///
/// Not restartable mid-page; restarting means re-calling
/// [`ChangeFeed::fetch_changes`] with the last-yielded cursor.
pub type ChangePage = Box<dyn Iterator<Item = Result<ChangeRecord>> + Send>;

/// Capability contract implemented once per upstream protocol family.
///
/// Kinds differ only in cursor representation and page shape; the
/// external contract is identical. Every yielded record's cursor differs
/// from the `since` passed in — an upstream echoing the boundary item is
/// filtered out by the adapter.
pub trait ChangeFeed: Send + Sync {
    /// Resolves a starting cursor when none is stored: upstream's current
    /// position backed off by a small fixed number of units to tolerate
    /// minor upstream lag.
    fn initial_since(&self, registry: &Registry) -> Result<String>;

    /// Issues one upstream request and yields zero or more records.
    fn fetch_changes(&self, registry: &Registry, since: &str) -> Result<ChangePage>;
}

/// Static dispatch table from a registry's stored kind to its adapter.
pub fn feed_for(kind: RegistryKind) -> &'static dyn ChangeFeed {
    static NPM: NpmFeed = NpmFeed;
    static CNPMCORE: CnpmcoreFeed = CnpmcoreFeed;
    static CNPMJSON: CnpmjsonFeed = CnpmjsonFeed;
    match kind {
        RegistryKind::Npm => &NPM,
        RegistryKind::Cnpmcore => &CNPMCORE,
        RegistryKind::Cnpmjson => &CNPMJSON,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_covers_every_kind() {
        for kind in [
            RegistryKind::Npm,
            RegistryKind::Cnpmcore,
            RegistryKind::Cnpmjson,
        ] {
            let _ = feed_for(kind);
        }
    }
}
