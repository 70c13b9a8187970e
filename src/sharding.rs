use glob::Pattern;

use crate::error::{FlotillaError, Result};
use crate::external::StorageBackend;
use crate::model::{ExecutionPlan, Spec};

/// Compute a job's execution plan from its sharding config.
///
/// No glob pattern means no sharding: the whole job is one shard. Otherwise
/// the glob is expanded against the job's input volumes and the matched
/// items are grouped into batches of `batch_size` (the last batch may be
/// smaller). The plan is computed once at submission and immutable
/// thereafter; there is no dynamic re-sharding.
pub fn plan(spec: &Spec, storage: &dyn StorageBackend) -> Result<ExecutionPlan> {
    if spec.sharding.glob_pattern.is_empty() {
        return Ok(ExecutionPlan { shards_total: 1 });
    }

    let items = matching_items(spec, storage)?;
    if items.is_empty() {
        return Err(FlotillaError::NoMatchingInputs(
            spec.sharding.glob_pattern.clone(),
        ));
    }

    let batch_size = spec.sharding.batch_size.max(1);
    let shards_total = items.len().div_ceil(batch_size);
    tracing::debug!(
        items = items.len(),
        batch_size,
        shards_total,
        "Execution plan computed"
    );
    Ok(ExecutionPlan { shards_total })
}

/// Expand the sharding glob over every input volume and return the matched
/// item paths, in volume order then listing order.
pub fn matching_items(spec: &Spec, storage: &dyn StorageBackend) -> Result<Vec<String>> {
    let pattern = Pattern::new(&anchored_pattern(spec)).map_err(|err| {
        FlotillaError::InvalidSpec(format!(
            "bad sharding glob '{}': {}",
            spec.sharding.glob_pattern, err
        ))
    })?;

    let mut matched = Vec::new();
    for volume in &spec.inputs {
        for item in storage.list(volume)? {
            if pattern.matches(&item) {
                matched.push(item);
            }
        }
    }
    Ok(matched)
}

/// The glob anchored at the configured base path. An absolute pattern is
/// used as-is; a relative one is joined onto the base path ("/" when unset).
fn anchored_pattern(spec: &Spec) -> String {
    let glob = &spec.sharding.glob_pattern;
    if glob.starts_with('/') {
        return glob.clone();
    }
    let base = if spec.sharding.base_path.is_empty() {
        "/"
    } else {
        &spec.sharding.base_path
    };
    format!("{}/{}", base.trim_end_matches('/'), glob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShardingConfig;

    fn spec_with_glob(glob: &str, base: &str) -> Spec {
        Spec {
            sharding: ShardingConfig {
                glob_pattern: glob.to_string(),
                batch_size: 1,
                base_path: base.to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_anchored_pattern_joins_base_path() {
        let spec = spec_with_glob("*.csv", "/inputs");
        assert_eq!(anchored_pattern(&spec), "/inputs/*.csv");
    }

    #[test]
    fn test_anchored_pattern_keeps_absolute_glob() {
        let spec = spec_with_glob("/data/*", "/inputs");
        assert_eq!(anchored_pattern(&spec), "/data/*");
    }

    #[test]
    fn test_anchored_pattern_defaults_to_root() {
        let spec = spec_with_glob("*", "");
        assert_eq!(anchored_pattern(&spec), "/*");
    }
}
