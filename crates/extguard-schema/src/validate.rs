use crate::SchemaError;

pub const MAX_RESOURCE_NAME_LEN: usize = 253;
pub const MAX_PACKAGE_NAME_LEN: usize = 48;

/// DNS-1123 subdomain: lowercase alphanumerics, `-` and `.`, starting and
/// ending with an alphanumeric.
pub fn validate_resource_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.len() > MAX_RESOURCE_NAME_LEN {
        return Err(SchemaError::InvalidName(format!(
            "resource name must be 1-{MAX_RESOURCE_NAME_LEN} characters"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
    {
        return Err(SchemaError::InvalidName(format!(
            "resource name '{name}' must match [a-z0-9.-]"
        )));
    }
    if !starts_and_ends_alphanumeric(name) {
        return Err(SchemaError::InvalidName(format!(
            "resource name '{name}' must start and end with an alphanumeric character"
        )));
    }
    Ok(())
}

/// Package names are single DNS labels of at most 48 characters
/// without leading, trailing or doubled dashes.
pub fn validate_package_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.len() > MAX_PACKAGE_NAME_LEN {
        return Err(SchemaError::InvalidPackage(format!(
            "package name must be 1-{MAX_PACKAGE_NAME_LEN} characters"
        )));
    }
    let well_formed = name.split('-').all(|seg| {
        !seg.is_empty()
            && seg
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    });
    if !well_formed {
        return Err(SchemaError::InvalidPackage(format!(
            "package name '{name}' must match ^[a-z0-9]+(-[a-z0-9]+)*$"
        )));
    }
    Ok(())
}

fn starts_and_ends_alphanumeric(s: &str) -> bool {
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    matches!((s.bytes().next(), s.bytes().last()), (Some(a), Some(z)) if alnum(a) && alnum(z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_name_valid_chars() {
        assert!(validate_resource_name("test-extension-first").is_ok());
        assert!(validate_resource_name("a").is_ok());
        assert!(validate_resource_name("ext.v1").is_ok());
        assert!(validate_resource_name(&"x".repeat(253)).is_ok());
    }

    #[test]
    fn resource_name_rejects_empty_and_too_long() {
        assert!(validate_resource_name("").is_err());
        assert!(validate_resource_name(&"x".repeat(254)).is_err());
    }

    #[test]
    fn resource_name_rejects_uppercase_and_symbols() {
        assert!(validate_resource_name("Ext").is_err());
        assert!(validate_resource_name("has space").is_err());
        assert!(validate_resource_name("has_underscore").is_err());
        assert!(validate_resource_name("has/slash").is_err());
    }

    #[test]
    fn resource_name_rejects_dangling_separators() {
        assert!(validate_resource_name("-ext").is_err());
        assert!(validate_resource_name("ext-").is_err());
        assert!(validate_resource_name(".ext").is_err());
    }

    #[test]
    fn package_name_valid() {
        assert!(validate_package_name("package1").is_ok());
        assert!(validate_package_name("pkg-x").is_ok());
        assert!(validate_package_name(&"p".repeat(48)).is_ok());
    }

    #[test]
    fn package_name_rejects_malformed() {
        assert!(validate_package_name("").is_err());
        assert!(validate_package_name(&"p".repeat(49)).is_err());
        assert!(validate_package_name("pkg--x").is_err());
        assert!(validate_package_name("-pkg").is_err());
        assert!(validate_package_name("pkg.x").is_err());
        assert!(validate_package_name("PKG").is_err());
    }
}
