//! ip2geo enrichment processor
//!
//! This module provides the `Ip2GeoProcessor`, which enriches one record at a
//! time:
//! - Extract one IP or an array of IPs from the source field
//! - Resolve the datasource through the registry cache
//! - Write an expired marker instead of looking up stale data
//! - Look up a single IP directly, or many IPs through the `LookupBatcher`
//! - Project the requested properties into the target field
//!
//! Processors are built by the `Ip2GeoProcessorFactory` from a JSON option
//! object, and tracked per pipeline by the `ProcessorRegistry`.
//!
//! # Example
//!
//! ```rust,ignore
//! use ip2geo::lens::processor::{CreateMode, Document, Ip2GeoProcessorFactory};
//!
//! let factory = Ip2GeoProcessorFactory::from_database(&db, config.batch_settings());
//! let processor = factory.create(
//!     Some("geo-tag"),
//!     None,
//!     &json!({"field": "src_ip", "datasource": "geo", "properties": ["country", "ip"]}),
//!     CreateMode::Validate,
//! )?;
//!
//! let doc = processor.execute(Document::from_value(record).unwrap()).await?;
//! ```

mod document;
mod factory;
mod registry;

pub use document::Document;
pub use factory::{CreateMode, Ip2GeoProcessorFactory};
pub use registry::ProcessorRegistry;

use crate::config::BatchSettings;
use crate::database::{DatasourceRegistryCache, GeoData, GeoDataStore};
use crate::error::Ip2GeoError;
use crate::lens::lookup::{BatchLookupArgs, LookupBatcher};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Processor type identifier
pub const PROCESSOR_TYPE: &str = "ip2geo";

/// Pseudo-property carrying the looked-up IP itself
pub const PROPERTY_IP: &str = "ip";

/// Default target field
pub const DEFAULT_TARGET_FIELD: &str = "ip2geo";

/// Value written to the target field when the datasource is expired
pub fn data_expired_marker() -> Value {
    json!({"error": "ip2geo_data_expired"})
}

// =============================================================================
// Args
// =============================================================================

/// Options of one processor instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ip2GeoProcessorArgs {
    /// Source field holding an IP or an array of IPs
    pub field: String,

    /// Field the geo attributes are written to
    pub target_field: String,

    /// Datasource to look IPs up in
    pub datasource: String,

    /// Properties to keep; all when `None`
    pub properties: Option<Vec<String>>,

    /// Pass records without the source field through unchanged
    pub ignore_missing: bool,

    /// For IP arrays, keep only the first match
    pub first_only: bool,
}

impl Ip2GeoProcessorArgs {
    pub fn new(field: impl Into<String>, datasource: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            target_field: DEFAULT_TARGET_FIELD.to_string(),
            datasource: datasource.into(),
            properties: None,
            ignore_missing: false,
            first_only: true,
        }
    }

    pub fn with_target_field(mut self, target_field: impl Into<String>) -> Self {
        self.target_field = target_field.into();
        self
    }

    /// Restrict output to `properties`; duplicates are dropped
    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut kept: Vec<String> = Vec::new();
        for property in properties {
            let property = property.into();
            if !kept.contains(&property) {
                kept.push(property);
            }
        }
        self.properties = Some(kept);
        self
    }

    pub fn with_ignore_missing(mut self, ignore_missing: bool) -> Self {
        self.ignore_missing = ignore_missing;
        self
    }

    pub fn with_first_only(mut self, first_only: bool) -> Self {
        self.first_only = first_only;
        self
    }
}

// =============================================================================
// Types
// =============================================================================

/// IP value(s) extracted from the source field
#[derive(Debug, Clone, PartialEq, Eq)]
enum IpInput {
    Single(String),
    Multiple(Vec<String>),
}

/// Outcome of resolving the datasource for one record
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Serving(String),
    Expired,
}

// =============================================================================
// Processor
// =============================================================================

/// Enriches records with geo attributes of their IPs
pub struct Ip2GeoProcessor {
    tag: Option<String>,
    description: Option<String>,
    args: Ip2GeoProcessorArgs,
    cache: Arc<DatasourceRegistryCache>,
    store: Arc<dyn GeoDataStore>,
    batcher: LookupBatcher,
    settings: BatchSettings,
}

impl Ip2GeoProcessor {
    pub fn new(
        tag: Option<String>,
        description: Option<String>,
        args: Ip2GeoProcessorArgs,
        cache: Arc<DatasourceRegistryCache>,
        store: Arc<dyn GeoDataStore>,
        settings: BatchSettings,
    ) -> Self {
        let batcher = LookupBatcher::new(store.clone());
        Self {
            tag,
            description,
            args,
            cache,
            store,
            batcher,
            settings,
        }
    }

    pub fn processor_type(&self) -> &'static str {
        PROCESSOR_TYPE
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn args(&self) -> &Ip2GeoProcessorArgs {
        &self.args
    }

    pub fn datasource(&self) -> &str {
        &self.args.datasource
    }

    /// Enrich `doc`
    ///
    /// Either the enriched record or an error is returned; a failed record is
    /// never partially modified.
    pub async fn execute(&self, mut doc: Document) -> Result<Document, Ip2GeoError> {
        let Some(input) = self.extract(&doc)? else {
            return Ok(doc);
        };

        let index_name = match self.resolve().await? {
            Resolution::Serving(index_name) => index_name,
            Resolution::Expired => {
                doc.set_field(&self.args.target_field, data_expired_marker());
                return Ok(doc);
            }
        };

        match input {
            IpInput::Single(ip) => {
                let data = self.store.fetch_one(&index_name, &ip).await?;
                if !data.is_empty() {
                    doc.set_field(&self.args.target_field, Value::Object(self.project(&data, &ip)));
                }
            }
            IpInput::Multiple(ips) => {
                let args = BatchLookupArgs::with_settings(index_name, self.settings);
                let results = self.batcher.lookup(&args, ips.clone()).await?;
                if let Some(value) = self.merge(&ips, &results) {
                    doc.set_field(&self.args.target_field, value);
                }
            }
        }

        Ok(doc)
    }

    /// Enrich `doc` on the runtime and deliver the outcome to `handler`
    ///
    /// `handler` is called exactly once, with the enriched record or the error.
    /// A panic during enrichment is delivered as a storage error.
    pub fn execute_with_handler<F>(self: &Arc<Self>, doc: Document, handler: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Document, Ip2GeoError>) + Send + 'static,
    {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let enrichment = tokio::spawn({
                let processor = Arc::clone(&processor);
                async move { processor.execute(doc).await }
            });
            let result = enrichment.await.unwrap_or_else(|e| {
                Err(Ip2GeoError::Storage(anyhow!("Enrichment task failed: {}", e)))
            });
            if let Err(e) = &result {
                debug!(
                    tag = ?processor.tag,
                    datasource = %processor.args.datasource,
                    error = %e,
                    "Enrichment failed"
                );
            }
            handler(result);
        })
    }

    /// Keep only the requested properties of `data`
    ///
    /// The `ip` property is always the looked-up IP; requested properties
    /// missing from `data` are left out.
    pub fn project(&self, data: &GeoData, ip: &str) -> GeoData {
        let Some(properties) = &self.args.properties else {
            return data.clone();
        };

        let mut projected = GeoData::new();
        for property in properties {
            if property == PROPERTY_IP {
                projected.insert(property.clone(), Value::String(ip.to_string()));
            } else if let Some(value) = data.get(property) {
                projected.insert(property.clone(), value.clone());
            }
        }
        projected
    }

    fn extract(&self, doc: &Document) -> Result<Option<IpInput>, Ip2GeoError> {
        let field = &self.args.field;
        match doc.get_field(field) {
            None | Some(Value::Null) => {
                if self.args.ignore_missing {
                    Ok(None)
                } else {
                    Err(Ip2GeoError::MissingField(field.clone()))
                }
            }
            Some(Value::String(ip)) => Ok(Some(IpInput::Single(ip.clone()))),
            Some(Value::Array(values)) => {
                let mut ips = Vec::with_capacity(values.len());
                for value in values {
                    match value {
                        Value::String(ip) => ips.push(ip.clone()),
                        _ => return Err(Ip2GeoError::InvalidArrayElement(field.clone())),
                    }
                }
                Ok(Some(IpInput::Multiple(ips)))
            }
            Some(_) => Err(Ip2GeoError::InvalidFieldType(field.clone())),
        }
    }

    async fn resolve(&self) -> Result<Resolution, Ip2GeoError> {
        let name = &self.args.datasource;
        let Some(entry) = self.cache.resolve(name).await? else {
            return Err(Ip2GeoError::DatasourceNotFound(name.clone()));
        };

        if entry.is_expired() {
            debug!(datasource = %name, "Datasource expired, skipping lookup");
            return Ok(Resolution::Expired);
        }

        entry
            .index_name
            .map(Resolution::Serving)
            .ok_or_else(|| Ip2GeoError::DatasourceNotAvailable(name.clone()))
    }

    /// Combine per-IP results in input order; `None` when nothing matched
    fn merge(&self, ips: &[String], results: &HashMap<String, GeoData>) -> Option<Value> {
        let matched = |ip: &String| results.get(ip).filter(|data| !data.is_empty());

        if self.args.first_only {
            return ips.iter().find_map(|ip| {
                matched(ip).map(|data| Value::Object(self.project(data, ip)))
            });
        }

        let mut any = false;
        let slots: Vec<Value> = ips
            .iter()
            .map(|ip| match matched(ip) {
                Some(data) => {
                    any = true;
                    Value::Object(self.project(data, ip))
                }
                None => Value::Null,
            })
            .collect();

        any.then_some(Value::Array(slots))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Datasource, DatasourceState, DatasourceStore};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockDatasources {
        datasources: Vec<Datasource>,
    }

    #[async_trait]
    impl DatasourceStore for MockDatasources {
        async fn get_datasource(&self, name: &str) -> Result<Option<Datasource>> {
            self.get_datasource_blocking(name)
        }

        fn get_datasource_blocking(&self, name: &str) -> Result<Option<Datasource>> {
            Ok(self.datasources.iter().find(|d| d.name == name).cloned())
        }

        async fn get_all_datasources(&self) -> Result<Vec<Datasource>> {
            Ok(self.datasources.clone())
        }
    }

    /// Geo data keyed by IP, counting every IP fetched
    #[derive(Default)]
    struct MockGeoData {
        data: HashMap<String, GeoData>,
        fetches: AtomicUsize,
        fetched: Mutex<Vec<String>>,
        fail: bool,
        panic: bool,
    }

    impl MockGeoData {
        fn with(entries: Vec<(&str, Value)>) -> Self {
            Self {
                data: entries
                    .into_iter()
                    .map(|(ip, v)| (ip.to_string(), v.as_object().unwrap().clone()))
                    .collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl GeoDataStore for MockGeoData {
        async fn fetch_one(&self, index_name: &str, ip: &str) -> Result<GeoData> {
            assert_eq!(index_name, "geo-v3");
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.fetched.lock().unwrap().push(ip.to_string());
            if self.panic {
                panic!("geo data reader crashed");
            }
            if self.fail {
                return Err(anyhow!("index unavailable"));
            }
            Ok(self.data.get(ip).cloned().unwrap_or_default())
        }

        async fn fetch_bundle(
            &self,
            index_name: &str,
            ips: Vec<String>,
        ) -> Result<HashMap<String, GeoData>> {
            assert_eq!(index_name, "geo-v3");
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.fetched.lock().unwrap().extend(ips.iter().cloned());
            if self.fail {
                return Err(anyhow!("index unavailable"));
            }
            Ok(ips
                .into_iter()
                .filter_map(|ip| self.data.get(&ip).cloned().map(|d| (ip, d)))
                .collect())
        }
    }

    fn geo_datasource() -> Datasource {
        Datasource::new("geo", "https://example.com/manifest.json")
            .with_state(DatasourceState::Available)
            .with_current_index("geo-v3")
            .with_fields(["country", "city"])
            .with_valid_for_in_days(Some(3))
            .with_last_succeeded_at(Utc::now())
    }

    fn sample_geo_data() -> Arc<MockGeoData> {
        Arc::new(MockGeoData::with(vec![
            ("8.8.8.8", json!({"country": "US", "city": "Mountain View"})),
            ("9.9.9.9", json!({"country": "CH", "city": "Zurich"})),
        ]))
    }

    fn processor_with(
        args: Ip2GeoProcessorArgs,
        datasources: Vec<Datasource>,
        geo: Arc<MockGeoData>,
    ) -> Ip2GeoProcessor {
        let cache = Arc::new(DatasourceRegistryCache::new(Arc::new(MockDatasources {
            datasources,
        })));
        Ip2GeoProcessor::new(
            Some("tag".to_string()),
            None,
            args,
            cache,
            geo,
            BatchSettings::new(1, 2),
        )
    }

    fn doc(value: Value) -> Document {
        Document::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_single_ip_with_projection() {
        let args = Ip2GeoProcessorArgs::new("src_ip", "geo").with_properties(["country", "ip"]);
        let processor = processor_with(args, vec![geo_datasource()], sample_geo_data());

        let result = processor
            .execute(doc(json!({"src_ip": "8.8.8.8"})))
            .await
            .unwrap();

        assert_eq!(
            result.get_field("ip2geo"),
            Some(&json!({"country": "US", "ip": "8.8.8.8"}))
        );
    }

    #[tokio::test]
    async fn test_single_ip_all_properties() {
        let args = Ip2GeoProcessorArgs::new("src_ip", "geo").with_target_field("geo.info");
        let processor = processor_with(args, vec![geo_datasource()], sample_geo_data());

        let result = processor
            .execute(doc(json!({"src_ip": "9.9.9.9"})))
            .await
            .unwrap();

        assert_eq!(
            result.get_field("geo.info"),
            Some(&json!({"country": "CH", "city": "Zurich"}))
        );
    }

    #[tokio::test]
    async fn test_single_ip_no_match_leaves_record() {
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo"),
            vec![geo_datasource()],
            sample_geo_data(),
        );

        let input = json!({"src_ip": "1.1.1.1"});
        let result = processor.execute(doc(input.clone())).await.unwrap();
        assert_eq!(result.into_value(), input);
    }

    #[tokio::test]
    async fn test_multi_ip_first_only() {
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo").with_properties(["country"]),
            vec![geo_datasource()],
            sample_geo_data(),
        );

        let result = processor
            .execute(doc(json!({"src_ip": ["1.1.1.1", "9.9.9.9"]})))
            .await
            .unwrap();

        assert_eq!(result.get_field("ip2geo"), Some(&json!({"country": "CH"})));
    }

    #[tokio::test]
    async fn test_multi_ip_all_results_in_order() {
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo")
                .with_properties(["country"])
                .with_first_only(false),
            vec![geo_datasource()],
            sample_geo_data(),
        );

        let result = processor
            .execute(doc(json!({"src_ip": ["1.1.1.1", "9.9.9.9"]})))
            .await
            .unwrap();

        assert_eq!(
            result.get_field("ip2geo"),
            Some(&json!([null, {"country": "CH"}]))
        );
    }

    #[tokio::test]
    async fn test_multi_ip_duplicates_share_result() {
        let geo = sample_geo_data();
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo")
                .with_properties(["ip", "country"])
                .with_first_only(false),
            vec![geo_datasource()],
            geo.clone(),
        );

        let result = processor
            .execute(doc(json!({"src_ip": ["8.8.8.8", "1.1.1.1", "8.8.8.8"]})))
            .await
            .unwrap();

        let expected = json!({"country": "US", "ip": "8.8.8.8"});
        assert_eq!(
            result.get_field("ip2geo"),
            Some(&json!([expected, null, expected]))
        );

        let fetched = geo.fetched.lock().unwrap();
        assert_eq!(fetched.iter().filter(|ip| *ip == "8.8.8.8").count(), 1);
    }

    #[tokio::test]
    async fn test_multi_ip_no_match_leaves_record() {
        for first_only in [true, false] {
            let processor = processor_with(
                Ip2GeoProcessorArgs::new("src_ip", "geo").with_first_only(first_only),
                vec![geo_datasource()],
                sample_geo_data(),
            );

            let input = json!({"src_ip": ["1.1.1.1", "2.2.2.2"]});
            let result = processor.execute(doc(input.clone())).await.unwrap();
            assert_eq!(result.into_value(), input);
        }
    }

    #[tokio::test]
    async fn test_expired_writes_marker_without_fetch() {
        let geo = sample_geo_data();
        let stale = geo_datasource().with_last_succeeded_at(Utc::now() - Duration::days(30));
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo"),
            vec![stale],
            geo.clone(),
        );

        let result = processor
            .execute(doc(json!({"src_ip": "8.8.8.8"})))
            .await
            .unwrap();

        assert_eq!(result.get_field("ip2geo"), Some(&data_expired_marker()));
        assert_eq!(geo.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_datasource_fails() {
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo"),
            vec![],
            sample_geo_data(),
        );

        let err = processor
            .execute(doc(json!({"src_ip": "8.8.8.8"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Ip2GeoError::DatasourceNotFound(ref name) if name == "geo"));
    }

    #[tokio::test]
    async fn test_no_serving_index_fails() {
        let mut datasource = geo_datasource();
        datasource.current_index = None;
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo"),
            vec![datasource],
            sample_geo_data(),
        );

        let err = processor
            .execute(doc(json!({"src_ip": "8.8.8.8"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Ip2GeoError::DatasourceNotAvailable(_)));
    }

    #[tokio::test]
    async fn test_missing_field() {
        let strict = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo"),
            vec![geo_datasource()],
            sample_geo_data(),
        );
        let err = strict.execute(doc(json!({"other": 1}))).await.unwrap_err();
        assert!(matches!(err, Ip2GeoError::MissingField(_)));

        let lenient = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo").with_ignore_missing(true),
            vec![geo_datasource()],
            sample_geo_data(),
        );
        for input in [json!({"other": 1}), json!({"src_ip": null})] {
            let result = lenient.execute(doc(input.clone())).await.unwrap();
            assert_eq!(result.into_value(), input);
        }
    }

    #[tokio::test]
    async fn test_wrong_field_types() {
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo"),
            vec![geo_datasource()],
            sample_geo_data(),
        );

        let err = processor
            .execute(doc(json!({"src_ip": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, Ip2GeoError::InvalidFieldType(_)));

        let err = processor
            .execute(doc(json!({"src_ip": ["8.8.8.8", 7]})))
            .await
            .unwrap_err();
        assert!(matches!(err, Ip2GeoError::InvalidArrayElement(_)));
    }

    #[tokio::test]
    async fn test_storage_failure_leaves_no_partial_result() {
        let geo = Arc::new(MockGeoData {
            fail: true,
            ..Default::default()
        });
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo").with_first_only(false),
            vec![geo_datasource()],
            geo,
        );

        let err = processor
            .execute(doc(json!({"src_ip": ["8.8.8.8", "9.9.9.9"]})))
            .await
            .unwrap_err();
        assert!(matches!(err, Ip2GeoError::Storage(_)));
    }

    #[tokio::test]
    async fn test_enrichment_is_idempotent() {
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo").with_properties(["city"]),
            vec![geo_datasource()],
            sample_geo_data(),
        );

        let first = processor
            .execute(doc(json!({"src_ip": "8.8.8.8"})))
            .await
            .unwrap();
        let second = processor.execute(first.clone()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_handler_called_once() {
        let processor = Arc::new(processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo"),
            vec![geo_datasource()],
            sample_geo_data(),
        ));

        let (tx, rx) = tokio::sync::oneshot::channel();
        processor
            .execute_with_handler(doc(json!({"src_ip": "8.8.8.8"})), move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        let result = rx.await.unwrap().unwrap();
        assert!(result.has_field("ip2geo"));
    }

    #[tokio::test]
    async fn test_handler_receives_error_when_lookup_panics() {
        let geo = Arc::new(MockGeoData {
            panic: true,
            ..Default::default()
        });
        let processor = Arc::new(processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo"),
            vec![geo_datasource()],
            geo,
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        processor
            .execute_with_handler(doc(json!({"src_ip": "8.8.8.8"})), {
                let calls = calls.clone();
                move |result| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(result);
                }
            })
            .await
            .unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Ip2GeoError::Storage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_projection_omits_absent_properties() {
        let processor = processor_with(
            Ip2GeoProcessorArgs::new("src_ip", "geo").with_properties(["country", "asn", "ip"]),
            vec![],
            sample_geo_data(),
        );
        let data = json!({"country": "US", "city": "Mountain View"})
            .as_object()
            .unwrap()
            .clone();

        let projected = processor.project(&data, "8.8.8.8");
        assert_eq!(
            Value::Object(projected),
            json!({"country": "US", "ip": "8.8.8.8"})
        );
    }

    #[test]
    fn test_args_dedupe_properties() {
        let args = Ip2GeoProcessorArgs::new("src_ip", "geo").with_properties(["ip", "city", "ip"]);
        assert_eq!(
            args.properties,
            Some(vec!["ip".to_string(), "city".to_string()])
        );
        assert_eq!(args.target_field, "ip2geo");
        assert!(args.first_only);
        assert!(!args.ignore_missing);
    }
}
