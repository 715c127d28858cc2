use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use super::{Ip2GeoProcessor, Ip2GeoProcessorArgs, DEFAULT_TARGET_FIELD, PROCESSOR_TYPE, PROPERTY_IP};
use crate::config::BatchSettings;
use crate::database::{
    DatasourceRegistryCache, DatasourceState, DatasourceStore, GeoDataStore, Ip2GeoDatabase,
};
use crate::error::Ip2GeoError;

/// Why a processor is being created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// A user defines the processor; the datasource and properties are checked
    Validate,
    /// Re-creation while applying already-validated cluster state; nothing is checked
    ApplyClusterState,
}

/// Builds `Ip2GeoProcessor`s from JSON option objects
pub struct Ip2GeoProcessorFactory {
    datasources: Arc<dyn DatasourceStore>,
    cache: Arc<DatasourceRegistryCache>,
    geo_data: Arc<dyn GeoDataStore>,
    settings: BatchSettings,
}

impl Ip2GeoProcessorFactory {
    pub fn new(
        datasources: Arc<dyn DatasourceStore>,
        cache: Arc<DatasourceRegistryCache>,
        geo_data: Arc<dyn GeoDataStore>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            datasources,
            cache,
            geo_data,
            settings,
        }
    }

    /// Factory over `db`, with a registry cache subscribed to its datasource writes
    pub fn from_database(db: &Ip2GeoDatabase, settings: BatchSettings) -> Self {
        Self::new(
            Arc::new(db.datasources()),
            db.registry_cache(),
            Arc::new(db.geo_data()),
            settings,
        )
    }

    /// Create a processor from `config`
    ///
    /// Recognized options: `field` (required), `target_field`, `datasource`
    /// (required), `properties`, `ignore_missing` and `first_only`. Any other
    /// option is rejected.
    pub fn create(
        &self,
        tag: Option<&str>,
        description: Option<&str>,
        config: &Value,
        mode: CreateMode,
    ) -> Result<Ip2GeoProcessor, Ip2GeoError> {
        let args = parse_args(tag, config)?;

        if mode == CreateMode::Validate {
            self.validate(tag, &args)?;
        }

        info!(
            tag = ?tag,
            datasource = %args.datasource,
            field = %args.field,
            target_field = %args.target_field,
            "Created ip2geo processor"
        );

        Ok(Ip2GeoProcessor::new(
            tag.map(str::to_string),
            description.map(str::to_string),
            args,
            self.cache.clone(),
            self.geo_data.clone(),
            self.settings,
        ))
    }

    /// Check that the datasource is available and serves every requested property
    pub fn validate(&self, tag: Option<&str>, args: &Ip2GeoProcessorArgs) -> Result<(), Ip2GeoError> {
        let name = &args.datasource;
        let Some(datasource) = self.datasources.get_datasource_blocking(name)? else {
            return Err(Ip2GeoError::configuration(
                tag,
                "datasource",
                format!("datasource [{}] doesn't exist", name),
            ));
        };

        if datasource.state != DatasourceState::Available {
            return Err(Ip2GeoError::configuration(
                tag,
                "datasource",
                format!("datasource [{}] is not in an available state", name),
            ));
        }

        let Some(properties) = &args.properties else {
            return Ok(());
        };

        let available = &datasource.database.fields;
        for property in properties {
            if property != PROPERTY_IP && !available.contains(property) {
                return Err(Ip2GeoError::configuration(
                    tag,
                    "properties",
                    format!(
                        "property [{}] is not available in the datasource [{}]",
                        property, name
                    ),
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Option parsing
// =============================================================================

fn parse_args(tag: Option<&str>, config: &Value) -> Result<Ip2GeoProcessorArgs, Ip2GeoError> {
    let Value::Object(options) = config else {
        return Err(Ip2GeoError::configuration(
            tag,
            "config",
            format!(
                "processor [{}] options must be an object, but of type [{}]",
                PROCESSOR_TYPE,
                type_name(config)
            ),
        ));
    };
    let mut options = options.clone();

    let field = read_string(tag, &mut options, "field")?;
    let target_field = read_optional_string(tag, &mut options, "target_field")?
        .unwrap_or_else(|| DEFAULT_TARGET_FIELD.to_string());
    let datasource = read_string(tag, &mut options, "datasource")?;
    let properties = read_optional_list(tag, &mut options, "properties")?;
    let ignore_missing = read_bool(tag, &mut options, "ignore_missing", false)?;
    let first_only = read_bool(tag, &mut options, "first_only", true)?;

    if let Some(unknown) = options.keys().next() {
        return Err(Ip2GeoError::configuration(
            tag,
            unknown.clone(),
            format!(
                "processor [{}] doesn't support one or more provided configuration parameters",
                PROCESSOR_TYPE
            ),
        ));
    }

    let mut args = Ip2GeoProcessorArgs::new(field, datasource)
        .with_target_field(target_field)
        .with_ignore_missing(ignore_missing)
        .with_first_only(first_only);
    if let Some(properties) = properties {
        args = args.with_properties(properties);
    }
    Ok(args)
}

fn read_string(
    tag: Option<&str>,
    options: &mut Map<String, Value>,
    key: &str,
) -> Result<String, Ip2GeoError> {
    read_optional_string(tag, options, key)?
        .ok_or_else(|| Ip2GeoError::configuration(tag, key, "required property is missing"))
}

fn read_optional_string(
    tag: Option<&str>,
    options: &mut Map<String, Value>,
    key: &str,
) -> Result<Option<String>, Ip2GeoError> {
    match options.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(wrong_type(tag, key, "a string", &other)),
    }
}

fn read_bool(
    tag: Option<&str>,
    options: &mut Map<String, Value>,
    key: &str,
    default: bool,
) -> Result<bool, Ip2GeoError> {
    match options.remove(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(value)) => Ok(value),
        Some(other) => Err(wrong_type(tag, key, "a boolean", &other)),
    }
}

fn read_optional_list(
    tag: Option<&str>,
    options: &mut Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, Ip2GeoError> {
    let values = match options.remove(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(values)) => values,
        Some(other) => return Err(wrong_type(tag, key, "a list", &other)),
    };

    let mut items = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::String(item) => items.push(item),
            other => return Err(wrong_type(tag, key, "a list of strings", &other)),
        }
    }
    Ok(Some(items))
}

fn wrong_type(tag: Option<&str>, key: &str, expected: &str, actual: &Value) -> Ip2GeoError {
    Ip2GeoError::configuration(
        tag,
        key,
        format!("property isn't {}, but of type [{}]", expected, type_name(actual)),
    )
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
