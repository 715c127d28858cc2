//! Error types for the enrichment surface
//!
//! Repositories report failures through `anyhow`; everything a processor
//! hands back to its caller is an [`Ip2GeoError`].

use thiserror::Error;

/// Failure of processor configuration or of one record's enrichment
#[derive(Error, Debug)]
pub enum Ip2GeoError {
    /// Invalid processor option or failed validation; fatal to configuration
    #[error("[{property}] {message}")]
    Configuration {
        processor_tag: Option<String>,
        property: String,
        message: String,
    },

    /// Source field absent and `ignore_missing` is off
    #[error("field [{0}] not present as part of path [{0}]")]
    MissingField(String),

    /// Source field is neither a string nor an array
    #[error("field [{0}] should contain only string or array of strings")]
    InvalidFieldType(String),

    /// Source field is an array with a non-string element
    #[error("array in field [{0}] should only contain strings")]
    InvalidArrayElement(String),

    /// Datasource unknown at enrichment time
    #[error("datasource [{0}] does not exist")]
    DatasourceNotFound(String),

    /// Datasource has no index serving lookups
    #[error("datasource [{0}] is not in an available state")]
    DatasourceNotAvailable(String),

    /// Persistence or storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl Ip2GeoError {
    pub fn configuration(
        processor_tag: Option<&str>,
        property: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Ip2GeoError::Configuration {
            processor_tag: processor_tag.map(str::to_string),
            property: property.into(),
            message: message.into(),
        }
    }

    /// Option the configuration error refers to, if any
    pub fn property(&self) -> Option<&str> {
        match self {
            Ip2GeoError::Configuration { property, .. } => Some(property),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Ip2GeoError::Configuration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_configuration_message() {
        let err = Ip2GeoError::configuration(
            Some("tag-1"),
            "properties",
            "property [foo] is not available in the datasource [geo]",
        );
        assert_eq!(
            err.to_string(),
            "[properties] property [foo] is not available in the datasource [geo]"
        );
        assert_eq!(err.property(), Some("properties"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_record_level_messages() {
        assert_eq!(
            Ip2GeoError::InvalidFieldType("src_ip".to_string()).to_string(),
            "field [src_ip] should contain only string or array of strings"
        );
        assert_eq!(
            Ip2GeoError::DatasourceNotFound("geo".to_string()).to_string(),
            "datasource [geo] does not exist"
        );

        let err: Ip2GeoError = anyhow!("disk on fire").into();
        assert_eq!(err.to_string(), "Storage error: disk on fire");
        assert!(err.property().is_none());
    }
}
