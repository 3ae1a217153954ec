use crate::types::{PackageName, ResourceName, ResourceVersion};
use crate::validate::{validate_package_name, validate_resource_name};
use crate::SchemaError;
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "olm.operatorframework.io/v1alpha1";
pub const KIND: &str = "ClusterExtension";
pub const LIST_KIND: &str = "ClusterExtensionList";

/// Length of the random suffix appended to `metadata.generateName`.
pub const GENERATED_SUFFIX_LEN: usize = 5;
const SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "name_is_empty")]
    pub name: ResourceName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<ResourceVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionSpec {
    pub package_name: PackageName,
}

/// A cluster-scoped request to install one package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtension {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: ClusterExtensionSpec,
}

fn name_is_empty(name: &ResourceName) -> bool {
    name.is_empty()
}

fn default_api_version() -> String {
    API_VERSION.to_owned()
}

fn default_kind() -> String {
    KIND.to_owned()
}

impl ClusterExtension {
    pub fn new(name: impl Into<ResourceName>, package: impl Into<PackageName>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: name.into(),
                ..ObjectMeta::default()
            },
            spec: ClusterExtensionSpec {
                package_name: package.into(),
            },
        }
    }

    /// A resource whose name the store derives from `prefix` on create.
    pub fn with_generate_name(prefix: &str, package: impl Into<PackageName>) -> Self {
        let mut ext = Self::new("", package);
        ext.metadata.generate_name = Some(prefix.to_owned());
        ext
    }

    pub fn name(&self) -> &ResourceName {
        &self.metadata.name
    }

    pub fn package(&self) -> &PackageName {
        &self.spec.package_name
    }

    pub fn version(&self) -> Option<ResourceVersion> {
        self.metadata.resource_version
    }

    /// Check the object is well-formed for a write.
    ///
    /// An empty name is accepted when `generateName` is set; the name is
    /// filled in by the store before commit.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.kind != KIND {
            return Err(SchemaError::WrongKind(self.kind.clone()));
        }
        if self.metadata.name.is_empty() {
            match self.metadata.generate_name.as_deref() {
                Some(prefix) if !prefix.is_empty() => {
                    let sample = format!("{prefix}{}", "x".repeat(GENERATED_SUFFIX_LEN));
                    validate_resource_name(&sample)?;
                }
                _ => {
                    return Err(SchemaError::InvalidName(
                        "metadata.name or metadata.generateName is required".to_owned(),
                    ))
                }
            }
        } else {
            validate_resource_name(&self.metadata.name)?;
        }
        validate_package_name(&self.spec.package_name)
    }
}

/// Expand a `generateName` prefix with a suffix derived from `seed`.
///
/// The store seeds this with its revision counter and draws again on the
/// rare collision with an existing name.
pub fn generated_name(prefix: &str, seed: u64) -> ResourceName {
    let digest = blake3::hash(format!("{prefix}:{seed}").as_bytes());
    let suffix: String = digest.as_bytes()[..GENERATED_SUFFIX_LEN]
        .iter()
        .map(|b| SUFFIX_ALPHABET[usize::from(*b) % SUFFIX_ALPHABET.len()] as char)
        .collect();
    ResourceName::new(format!("{prefix}{suffix}"))
}
