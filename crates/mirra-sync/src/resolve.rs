//! Decides which upstream registry a reconciliation request syncs from.

use mirra_config::{scope_of, Config, Registry};
use mirra_core::{LocalPackage, SyncPackagePayload};

use crate::error::{Result, SyncError};

/// Where a request ended up after ownership checks.
#[derive(Debug)]
pub enum Resolution<'a> {
    /// Sync from this registry.
    Sync(&'a Registry),
    /// Published directly on this deployment; never pulled from upstream.
    SkippedPrivate,
}

/// Resolution priority: recorded local ownership, explicit request, scope
/// binding, then the catch-all default. Resolving to a registry other
/// than the one already recorded on the package is a conflict, not a
/// sync; ownership never moves silently.
pub fn resolve_registry<'a>(
    config: &'a Config,
    local: Option<&LocalPackage>,
    payload: &SyncPackagePayload,
    fullname: &str,
) -> Result<Resolution<'a>> {
    let recorded = local.and_then(|p| p.registry_name.as_deref());
    // Private packages and anything recorded under this deployment's own
    // name are self-hosted; never pulled from upstream.
    if local.is_some_and(|p| p.is_private) || recorded == Some(config.self_registry()) {
        return Ok(Resolution::SkippedPrivate);
    }
    let resolved = if let Some(owner) = recorded.and_then(|name| config.registry(name)) {
        owner
    } else if let Some(name) = &payload.registry_name {
        config
            .registry(name)
            .ok_or_else(|| SyncError::UnknownRegistry(name.clone()))?
    } else if let Some(owner) =
        scope_of(fullname).and_then(|scope| config.registry_for_scope(scope))
    {
        owner
    } else {
        config.default_registry()?
    };

    if let Some(owner) = recorded {
        if owner != resolved.name {
            return Err(SyncError::RegistryConflict {
                fullname: fullname.to_string(),
                owner: owner.to_string(),
                requested: resolved.name.clone(),
            });
        }
    }
    if let Some(requested) = &payload.registry_name {
        if *requested != resolved.name {
            return Err(SyncError::RegistryConflict {
                fullname: fullname.to_string(),
                owner: resolved.name.clone(),
                requested: requested.clone(),
            });
        }
    }

    Ok(Resolution::Sync(resolved))
}
