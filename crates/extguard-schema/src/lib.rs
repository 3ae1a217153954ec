//! Resource model for the extguard package-uniqueness guard.
//!
//! This crate defines the schema layer: the `ClusterExtension` resource and its
//! JSON wire format, typed identifiers (`ResourceName`, `PackageName`,
//! `ResourceVersion`), name and package validation, and `generateName`
//! expansion.

pub mod resource;
pub mod types;
pub mod validate;

pub use resource::{
    generated_name, ClusterExtension, ClusterExtensionSpec, ObjectMeta, API_VERSION, KIND,
    LIST_KIND,
};
pub use types::{PackageName, ResourceName, ResourceVersion};
pub use validate::{validate_package_name, validate_resource_name};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid resource name: {0}")]
    InvalidName(String),
    #[error("invalid spec.packageName: {0}")]
    InvalidPackage(String),
    #[error("unsupported kind '{0}', expected ClusterExtension")]
    WrongKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_display_invalid_name() {
        let e = SchemaError::InvalidName("bad".to_owned());
        assert!(e.to_string().contains("invalid resource name"));
    }

    #[test]
    fn schema_error_display_wrong_kind() {
        let e = SchemaError::WrongKind("Pod".to_owned());
        let msg = e.to_string();
        assert!(msg.contains("Pod"));
        assert!(msg.contains(KIND));
    }
}
