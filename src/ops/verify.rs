//! Verify allocation metadata against share records

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::common::{timestamp_now_millis, Config, KVStore, Result};
use crate::provisioner::lock::list_locks;
use crate::provisioner::metadata::MetadataRepository;

/// Slot count of a container disagreeing with the shares placed on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountMismatch {
    pub backend: String,
    pub fpg: String,
    pub recorded: usize,
    pub actual: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub total_shares: usize,
    pub mounted_shares: usize,
    pub count_mismatches: Vec<CountMismatch>,
    /// `backend/fpg` of containers share records point at but metadata lacks
    pub unknown_containers: Vec<String>,
    /// `backend/fpg` of containers holding more shares than allowed
    pub over_capacity: Vec<String>,
    pub held_locks: usize,
    pub expired_locks: Vec<String>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.count_mismatches.is_empty()
            && self.unknown_containers.is_empty()
            && self.over_capacity.is_empty()
            && self.expired_locks.is_empty()
    }
}

/// Cross-check share records, backend metadata and locks.
///
/// Slot counts include in-flight reservations, so a check run while creates
/// are in progress may report transient mismatches.
pub fn verify_cluster(store: Arc<dyn KVStore>, config: &Config) -> Result<VerifyReport> {
    tracing::info!("Starting cluster verification");
    let repo = MetadataRepository::new(store.clone());
    let shares = repo.list_shares()?;

    let mut report = VerifyReport {
        total_shares: shares.len(),
        mounted_shares: shares.iter().filter(|s| s.is_mounted()).count(),
        ..Default::default()
    };

    // (backend, fpg) -> shares placed there
    let mut placed: BTreeMap<(String, String), usize> = BTreeMap::new();
    for share in &shares {
        *placed
            .entry((share.backend.clone(), share.fpg.clone()))
            .or_insert(0) += 1;
    }

    for backend in &config.backends {
        let Some(meta) = repo.get_backend(&backend.name)? else {
            continue;
        };
        for (fpg, alloc) in &meta.containers {
            let actual = placed
                .remove(&(backend.name.clone(), fpg.clone()))
                .unwrap_or(0);
            if actual != alloc.share_count {
                report.count_mismatches.push(CountMismatch {
                    backend: backend.name.clone(),
                    fpg: fpg.clone(),
                    recorded: alloc.share_count,
                    actual,
                });
            }
            if actual.max(alloc.share_count) > backend.max_shares_per_container {
                report.over_capacity.push(format!("{}/{}", backend.name, fpg));
            }
        }
    }
    report.unknown_containers = placed
        .into_keys()
        .map(|(backend, fpg)| format!("{}/{}", backend, fpg))
        .collect();

    let now = timestamp_now_millis();
    for (key, lock) in list_locks(store.as_ref())? {
        report.held_locks += 1;
        if lock.is_expired(now) {
            report.expired_locks.push(key);
        }
    }

    if report.is_healthy() {
        tracing::info!("Verified {} shares, no problems found", report.total_shares);
    } else {
        tracing::warn!(
            "Verification found {} count mismatches, {} unknown containers, {} over capacity, {} expired locks",
            report.count_mismatches.len(),
            report.unknown_containers.len(),
            report.over_capacity.len(),
            report.expired_locks.len()
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemStore;
    use crate::provisioner::metadata::tests::sample_share;
    use crate::provisioner::metadata::ContainerAlloc;

    fn config() -> Config {
        let mut config = Config::for_node("node-1", "10.0.0.5");
        config.backends[0].max_shares_per_container = 2;
        config
    }

    fn alloc(count: usize) -> ContainerAlloc {
        ContainerAlloc {
            pool: "cpg_a".into(),
            vfs: "vfs_cpg_a_1".into(),
            vfs_ips: vec!["10.50.3.21".into()],
            share_count: count,
        }
    }

    #[test]
    fn test_consistent_cluster_is_healthy() {
        let store: Arc<dyn KVStore> = Arc::new(MemStore::new());
        let repo = MetadataRepository::new(store.clone());
        repo.insert_share(&sample_share("alpha")).unwrap();
        repo.update_backend("DEFAULT", |m| {
            m.containers.insert("fpg_cpg_a_1".into(), alloc(1));
            Ok(())
        })
        .unwrap();

        let report = verify_cluster(store, &config()).unwrap();
        assert_eq!(report.total_shares, 1);
        assert!(report.is_healthy(), "{:?}", report);
    }

    #[test]
    fn test_reports_drift() {
        let store: Arc<dyn KVStore> = Arc::new(MemStore::new());
        let repo = MetadataRepository::new(store.clone());
        repo.insert_share(&sample_share("alpha")).unwrap();
        let mut stray = sample_share("beta");
        stray.fpg = "fpg_gone".into();
        repo.insert_share(&stray).unwrap();
        repo.update_backend("DEFAULT", |m| {
            m.containers.insert("fpg_cpg_a_1".into(), alloc(3));
            Ok(())
        })
        .unwrap();

        let report = verify_cluster(store, &config()).unwrap();
        assert_eq!(
            report.count_mismatches,
            vec![CountMismatch {
                backend: "DEFAULT".into(),
                fpg: "fpg_cpg_a_1".into(),
                recorded: 3,
                actual: 1,
            }]
        );
        assert_eq!(report.unknown_containers, vec!["DEFAULT/fpg_gone"]);
        assert_eq!(report.over_capacity, vec!["DEFAULT/fpg_cpg_a_1"]);
        assert!(!report.is_healthy());
    }
}
