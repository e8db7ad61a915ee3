//! Orphan sweep
//!
//! Records not touched by the run are orphans. They are deleted in reverse
//! derivation order: an orphan goes only after every orphan that lists it in
//! `depends_on` is gone. A failed delete keeps its record and blocks the
//! resources it was derived from; unrelated orphans are still swept.

use crate::action::SweepReport;
use crate::error::{EngineError, Result};
use crate::provider::{ProviderContext, ProviderError, ProviderRegistry};
use stackflow_state::{ScopeId, SecretCodec, StateRecord, StateStore};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Order in which orphans must be deleted (dependents first).
///
/// Orphans caught in a dependency cycle are appended in path order.
pub fn deletion_order(orphans: &BTreeMap<String, StateRecord>) -> Vec<String> {
    // 各オーファンを参照している (まだ削除されていない) オーファンの数
    let mut dependents: BTreeMap<&str, usize> =
        orphans.keys().map(|path| (path.as_str(), 0)).collect();
    for (path, record) in orphans {
        for dep in unique_deps(path, record) {
            if let Some(count) = dependents.get_mut(dep) {
                *count += 1;
            }
        }
    }

    let mut ready: BTreeSet<&str> = dependents
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(path, _)| *path)
        .collect();
    let mut order = Vec::with_capacity(orphans.len());
    while let Some(path) = ready.pop_first() {
        order.push(path.to_string());
        for dep in unique_deps(path, &orphans[path]) {
            if let Some(count) = dependents.get_mut(dep) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dep);
                }
            }
        }
    }

    if order.len() < orphans.len() {
        let emitted: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let cyclic: Vec<String> = orphans
            .keys()
            .filter(|path| !emitted.contains(path.as_str()))
            .cloned()
            .collect();
        tracing::warn!("Dependency cycle among orphans: {}", cyclic.join(", "));
        order.extend(cyclic);
    }
    order
}

fn unique_deps<'a>(path: &'a str, record: &'a StateRecord) -> BTreeSet<&'a str> {
    record
        .depends_on
        .iter()
        .map(String::as_str)
        .filter(|dep| *dep != path)
        .collect()
}

/// Delete every orphan, best effort.
///
/// Per-orphan provider failures are collected in the report. Decryption and
/// store failures abort the sweep.
pub(crate) async fn sweep(
    scope: &ScopeId,
    store: &dyn StateStore,
    codec: &SecretCodec,
    providers: &ProviderRegistry,
    orphans: BTreeMap<String, StateRecord>,
) -> Result<SweepReport> {
    let start = Instant::now();
    let mut report = SweepReport::new();
    // 削除できずに残ったパス (失敗またはブロック)
    let mut kept: BTreeSet<String> = BTreeSet::new();

    for path in deletion_order(&orphans) {
        let record = &orphans[&path];
        let blocked_by = orphans
            .iter()
            .filter(|(other, r)| kept.contains(*other) && r.depends_on.contains(&path))
            .map(|(other, _)| other.clone())
            .next();
        if let Some(dependent) = blocked_by {
            tracing::warn!("Keeping {}: {} could not be deleted", path, dependent);
            report.blocked.push(path.clone());
            kept.insert(path);
            continue;
        }

        match delete_orphan(scope, store, codec, providers, &path, record).await {
            Ok(()) => report.deleted.push(path),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!("Failed to delete orphan {}: {}", path, e);
                report.add_failure(path.clone(), e.to_string());
                kept.insert(path);
            }
        }
    }

    report.duration_ms = start.elapsed().as_millis() as u64;
    Ok(report)
}

async fn delete_orphan(
    scope: &ScopeId,
    store: &dyn StateStore,
    codec: &SecretCodec,
    providers: &ProviderRegistry,
    path: &str,
    record: &StateRecord,
) -> Result<()> {
    let provider = providers.get(&record.resource_type)?;
    let prior_output = codec.unseal(&record.output)?;
    let ctx = ProviderContext {
        scope: scope.clone(),
        resource_type: record.resource_type.clone(),
        id: record.id.clone(),
        path: path.to_string(),
    };

    tracing::info!("delete {}", path);
    match provider.delete(&ctx, &prior_output).await {
        Ok(()) => {}
        Err(ProviderError::NotFound(_)) => {
            tracing::debug!("{} was already gone", path);
        }
        Err(source) => {
            return Err(EngineError::Provider {
                path: path.to_string(),
                source,
            });
        }
    }

    store.delete(path).await?;
    Ok(())
}
