use crate::index::UniquenessIndex;
use crate::GuardError;
use extguard_schema::{ClusterExtension, PackageName, ResourceName};

/// Fast-path outcome for an intent that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The index shows no other owner. The commit still has to be arbitrated.
    Free,
    /// An update that keeps its package makes no new claim.
    Unchanged,
    /// The index is in its staleness window; only the commit can decide.
    Unverified,
}

/// Accept/reject decision against the [`UniquenessIndex`]. Reads only.
pub struct Validator<'a> {
    index: &'a UniquenessIndex,
}

impl<'a> Validator<'a> {
    pub fn new(index: &'a UniquenessIndex) -> Self {
        Self { index }
    }

    pub fn validate_create(&self, intent: &ClusterExtension) -> Result<Verdict, GuardError> {
        self.check_claim(intent.package(), intent.name())
    }

    /// `current` is the object as stored; the intent's own name never
    /// conflicts with itself.
    pub fn validate_update(
        &self,
        intent: &ClusterExtension,
        current: &ClusterExtension,
    ) -> Result<Verdict, GuardError> {
        if intent.package() == current.package() {
            return Ok(Verdict::Unchanged);
        }
        self.check_claim(intent.package(), current.name())
    }

    fn check_claim(
        &self,
        package: &PackageName,
        name: &ResourceName,
    ) -> Result<Verdict, GuardError> {
        if self.index.is_stale() {
            return Ok(Verdict::Unverified);
        }
        match self.index.lookup(package) {
            Some(owner) if owner.name != *name => Err(GuardError::PackageAlreadyClaimed {
                package: package.clone(),
                owner: owner.name,
            }),
            _ => Ok(Verdict::Free),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extguard_store::{EventType, Snapshot, WatchEvent};

    fn index_with(claims: &[(&str, &str)]) -> UniquenessIndex {
        let index = UniquenessIndex::new();
        index.rebuild(&Snapshot::default());
        for (i, (name, package)) in claims.iter().enumerate() {
            index.apply(&WatchEvent {
                kind: EventType::Added,
                object: ClusterExtension::new(*name, *package),
                revision: i as u64 + 1,
            });
        }
        index
    }

    #[test]
    fn create_on_claimed_package_is_rejected_naming_owner() {
        let index = index_with(&[("test-extension-first", "package1")]);
        let err = Validator::new(&index)
            .validate_create(&ClusterExtension::with_generate_name(
                "test-extension-",
                "package1",
            ))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Package "package1" is already installed via ClusterExtension "test-extension-first""#
        );
    }

    #[test]
    fn create_on_free_package_is_permitted() {
        let index = index_with(&[("a", "p1")]);
        let verdict = Validator::new(&index)
            .validate_create(&ClusterExtension::new("c", "p2"))
            .unwrap();
        assert_eq!(verdict, Verdict::Free);
    }

    #[test]
    fn recreate_by_same_owner_is_not_a_conflict() {
        let index = index_with(&[("a", "p1")]);
        let verdict = Validator::new(&index)
            .validate_create(&ClusterExtension::new("a", "p1"))
            .unwrap();
        assert_eq!(verdict, Verdict::Free);
    }

    #[test]
    fn unchanged_update_is_permitted_even_if_index_disagrees() {
        let index = index_with(&[("someone-else", "p1")]);
        let current = ClusterExtension::new("b", "p1");
        let verdict = Validator::new(&index)
            .validate_update(&ClusterExtension::new("b", "p1"), &current)
            .unwrap();
        assert_eq!(verdict, Verdict::Unchanged);
    }

    #[test]
    fn update_to_claimed_package_is_rejected() {
        let index = index_with(&[("a", "p1"), ("b", "p2")]);
        let current = ClusterExtension::new("b", "p2");
        let err = Validator::new(&index)
            .validate_update(&ClusterExtension::new("b", "p1"), &current)
            .unwrap_err();
        assert!(matches!(
            err,
            GuardError::PackageAlreadyClaimed { ref owner, .. } if owner == "a"
        ));
    }

    #[test]
    fn update_to_free_package_is_permitted() {
        let index = index_with(&[("a", "p1"), ("b", "p2")]);
        let current = ClusterExtension::new("b", "p2");
        let verdict = Validator::new(&index)
            .validate_update(&ClusterExtension::new("b", "p3"), &current)
            .unwrap();
        assert_eq!(verdict, Verdict::Free);
    }

    #[test]
    fn stale_index_cannot_vouch_either_way() {
        let index = index_with(&[("a", "p1")]);
        index.mark_stale();
        let v = Validator::new(&index);
        assert_eq!(
            v.validate_create(&ClusterExtension::new("b", "p1")).unwrap(),
            Verdict::Unverified
        );
        assert_eq!(
            v.validate_create(&ClusterExtension::new("b", "p9")).unwrap(),
            Verdict::Unverified
        );
    }
}
