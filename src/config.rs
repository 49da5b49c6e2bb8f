use std::time::Duration;

/// On-disk search index layout generation.
///
/// `V1` predates the properties-set field, so match-all queries must
/// enumerate terms. `V2` adds the field and lets match-all rewrite to a
/// single term lookup. `V3` additionally indexes case-transformed terms
/// for case-insensitive wildcard matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexFormatVersion {
    V1,
    V2,
    V3,
}

/// Repository tunables.
///
/// All fields correspond to environment-visible configuration options; the
/// defaults describe a standalone single-process deployment.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Byte budget for the strong secondary bundle cache.
    pub bundle_cache_size: usize,
    /// Binary values at or below this size are stored inline in the bundle.
    pub inline_blob_threshold: usize,
    /// Default lock timeout hint in seconds. Zero means no timeout.
    pub lock_default_timeout: u64,
    /// Creator string stamped on journal records from this process.
    /// `None` disables cluster journalling entirely.
    pub cluster_id: Option<String>,
    /// Wildcard queries enumerating more terms than this fall back to a
    /// bitset scan.
    pub max_clause_count: usize,
    /// Search index field layout generation.
    pub index_format: IndexFormatVersion,
    /// Capacity of the negative-entry (known missing) bundle cache.
    pub negative_cache_size: usize,
    /// Bundle cache access listeners fire once per this many retrievals.
    pub access_listener_interval: u64,
    /// Blobs younger than this are never reclaimed by mark-and-sweep.
    pub datastore_sweep_min_age: Duration,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            bundle_cache_size: 8 * 1024 * 1024,
            inline_blob_threshold: 4096,
            lock_default_timeout: 0,
            cluster_id: None,
            max_clause_count: 1024,
            index_format: IndexFormatVersion::V3,
            negative_cache_size: 1024,
            access_listener_interval: 128,
            datastore_sweep_min_age: Duration::from_secs(60 * 60),
        }
    }
}

impl RepoConfig {
    /// Configuration for a cluster member publishing under `cluster_id`.
    pub fn clustered(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: Some(cluster_id.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_standalone_deployment() {
        let config = RepoConfig::default();
        assert_eq!(config.bundle_cache_size, 8 * 1024 * 1024);
        assert_eq!(config.inline_blob_threshold, 4096);
        assert_eq!(config.lock_default_timeout, 0);
        assert_eq!(config.max_clause_count, 1024);
        assert_eq!(config.index_format, IndexFormatVersion::V3);
        assert!(config.cluster_id.is_none());
    }

    #[test]
    fn clustered_profile_only_flips_the_creator() {
        let config = RepoConfig::clustered("node-a");
        assert_eq!(config.cluster_id.as_deref(), Some("node-a"));
        assert_eq!(
            config.bundle_cache_size,
            RepoConfig::default().bundle_cache_size
        );
    }

    #[test]
    fn format_versions_are_ordered() {
        assert!(IndexFormatVersion::V1 < IndexFormatVersion::V2);
        assert!(IndexFormatVersion::V2 < IndexFormatVersion::V3);
    }
}
