use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::Ip2GeoProcessor;

/// ip2geo processors of every pipeline, keyed by pipeline id
///
/// The refresh job uses it to find the pipelines affected by a datasource.
#[derive(Default)]
pub struct ProcessorRegistry {
    pipelines: DashMap<String, Vec<Arc<Ip2GeoProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the processors of `pipeline_id`, replacing any previous ones
    pub fn register(&self, pipeline_id: impl Into<String>, processors: Vec<Arc<Ip2GeoProcessor>>) {
        let pipeline_id = pipeline_id.into();
        debug!(pipeline = %pipeline_id, processors = processors.len(), "Registering pipeline");
        self.pipelines.insert(pipeline_id, processors);
    }

    pub fn remove(&self, pipeline_id: &str) -> Option<Vec<Arc<Ip2GeoProcessor>>> {
        self.pipelines.remove(pipeline_id).map(|(_, processors)| processors)
    }

    /// Every registered processor bound to `datasource`
    pub fn processors_for_datasource(&self, datasource: &str) -> Vec<Arc<Ip2GeoProcessor>> {
        self.pipelines
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|processor| processor.datasource() == datasource)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn pipeline_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
