//! Per-namespace validation of lease names, holder names, and durations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::utils::LeaseError;

use tokio::time::Duration;

/// Namespace electing one unit per application as its leader.
pub const LEADERSHIP_NAMESPACE: &str = "application-leadership";

/// Namespace ensuring a single controller instance runs per-model work.
pub const SINGULAR_NAMESPACE: &str = "singular-controller";

/// Longest name any secretary accepts.
const MAX_NAME_LEN: usize = 255;

/// Longest lease duration any secretary accepts by default.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Validator of everything a caller hands in for one namespace. Runs on the
/// caller's side so malformed input never reaches the coordinator.
pub trait Secretary: fmt::Debug + Send + Sync + 'static {
    /// Checks a lease name.
    fn check_lease(&self, name: &str) -> Result<(), LeaseError>;

    /// Checks a holder name (also used for pinning entities unless
    /// overridden).
    fn check_holder(&self, holder: &str) -> Result<(), LeaseError>;

    /// Checks a pinning entity name. Entities are opaque; by default they
    /// only need to be non-empty and printable.
    fn check_entity(&self, entity: &str) -> Result<(), LeaseError> {
        if is_plain_token(entity) {
            Ok(())
        } else {
            Err(LeaseError::InvalidHolderName(entity.into()))
        }
    }

    /// Checks a requested lease duration: non-zero and no longer than
    /// `MAX_LEASE_DURATION`.
    fn check_duration(&self, duration: Duration) -> Result<(), LeaseError> {
        if duration.is_zero() || duration > MAX_LEASE_DURATION {
            Err(LeaseError::InvalidDuration(format!("{:?}", duration)))
        } else {
            Ok(())
        }
    }
}

/// Non-empty, bounded, and free of whitespace and control characters.
fn is_plain_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_NAME_LEN
        && !s.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Application names: lowercase-led segments of `[a-z0-9]` joined by single
/// hyphens, every segment containing at least one letter.
fn is_application_name(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_NAME_LEN {
        return false;
    }
    if !s.starts_with(|c: char| c.is_ascii_lowercase()) {
        return false;
    }
    s.split('-').all(|seg| {
        !seg.is_empty()
            && seg
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && seg.chars().any(|c| c.is_ascii_lowercase())
    })
}

/// Decimal number without sign or leading zeros (except "0" itself).
fn is_index(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'))
}

/// Canonical lowercase 8-4-4-4-12 UUID.
fn is_uuid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(g, len)| {
                g.len() == len
                    && g.chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            })
}

/// Leadership namespace: lease names are applications, holders are units of
/// that form `<application>/<number>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeadershipSecretary;

impl Secretary for LeadershipSecretary {
    fn check_lease(&self, name: &str) -> Result<(), LeaseError> {
        if is_application_name(name) {
            Ok(())
        } else {
            Err(LeaseError::InvalidLeaseName(name.into()))
        }
    }

    fn check_holder(&self, holder: &str) -> Result<(), LeaseError> {
        match holder.split_once('/') {
            Some((app, idx)) if is_application_name(app) && is_index(idx) => {
                Ok(())
            }
            _ => Err(LeaseError::InvalidHolderName(holder.into())),
        }
    }
}

/// Singular-controller namespace: lease names are model or controller UUIDs,
/// holders are agent tags `machine-<n>` or `controller-<n>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingularSecretary;

impl Secretary for SingularSecretary {
    fn check_lease(&self, name: &str) -> Result<(), LeaseError> {
        if is_uuid(name) {
            Ok(())
        } else {
            Err(LeaseError::InvalidLeaseName(name.into()))
        }
    }

    fn check_holder(&self, holder: &str) -> Result<(), LeaseError> {
        let idx = holder
            .strip_prefix("machine-")
            .or_else(|| holder.strip_prefix("controller-"));
        match idx {
            Some(idx) if is_index(idx) => Ok(()),
            _ => Err(LeaseError::InvalidHolderName(holder.into())),
        }
    }
}

/// Any other namespace: names and holders only need to be plain tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericSecretary;

impl Secretary for GenericSecretary {
    fn check_lease(&self, name: &str) -> Result<(), LeaseError> {
        if is_plain_token(name) {
            Ok(())
        } else {
            Err(LeaseError::InvalidLeaseName(name.into()))
        }
    }

    fn check_holder(&self, holder: &str) -> Result<(), LeaseError> {
        if is_plain_token(holder) {
            Ok(())
        } else {
            Err(LeaseError::InvalidHolderName(holder.into()))
        }
    }
}

/// Secretaries for the two built-in namespaces.
pub fn standard_secretaries() -> HashMap<String, Arc<dyn Secretary>> {
    let mut secretaries: HashMap<String, Arc<dyn Secretary>> = HashMap::new();
    secretaries.insert(LEADERSHIP_NAMESPACE.into(), Arc::new(LeadershipSecretary));
    secretaries.insert(SINGULAR_NAMESPACE.into(), Arc::new(SingularSecretary));
    secretaries
}

#[cfg(test)]
mod secretary_tests {
    use super::*;

    #[test]
    fn leadership_lease_names() {
        let s = LeadershipSecretary;
        for name in ["mysql", "wordpress-k8s", "a1", "foo-bar2-baz"] {
            assert_eq!(s.check_lease(name), Ok(()), "{}", name);
        }
        for name in ["", "MySQL", "1app", "foo--bar", "foo-", "foo-123", "a b"]
        {
            assert_eq!(
                s.check_lease(name),
                Err(LeaseError::InvalidLeaseName(name.into())),
                "{}",
                name
            );
        }
    }

    #[test]
    fn leadership_holder_names() {
        let s = LeadershipSecretary;
        assert_eq!(s.check_holder("mysql/0"), Ok(()));
        assert_eq!(s.check_holder("wordpress-k8s/17"), Ok(()));
        for holder in ["", "mysql", "mysql/", "mysql/01", "mysql/-1", "/0"] {
            assert_eq!(
                s.check_holder(holder),
                Err(LeaseError::InvalidHolderName(holder.into())),
                "{}",
                holder
            );
        }
    }

    #[test]
    fn singular_names() {
        let s = SingularSecretary;
        assert_eq!(
            s.check_lease("deadbeef-0bad-400d-8000-4b1d0d06f00d"),
            Ok(())
        );
        assert!(s.check_lease("deadbeef-0bad-400d-8000").is_err());
        assert!(s.check_lease("DEADBEEF-0BAD-400D-8000-4B1D0D06F00D").is_err());
        assert_eq!(s.check_holder("machine-0"), Ok(()));
        assert_eq!(s.check_holder("controller-12"), Ok(()));
        assert!(s.check_holder("unit-mysql-0").is_err());
        assert!(s.check_holder("machine-").is_err());
    }

    #[test]
    fn generic_names() {
        let s = GenericSecretary;
        assert_eq!(s.check_lease("anything/at:all"), Ok(()));
        assert!(s.check_lease("").is_err());
        assert!(s.check_holder("has space").is_err());
        assert!(s.check_holder(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn durations_and_entities() {
        let s = LeadershipSecretary;
        assert!(s.check_duration(Duration::ZERO).is_err());
        assert_eq!(s.check_duration(Duration::from_secs(30)), Ok(()));
        assert_eq!(s.check_duration(MAX_LEASE_DURATION), Ok(()));
        assert!(matches!(
            s.check_duration(MAX_LEASE_DURATION + Duration::from_secs(1)),
            Err(LeaseError::InvalidDuration(_))
        ));
        assert!(s.check_duration(Duration::MAX).is_err());
        assert_eq!(s.check_entity("migration-123"), Ok(()));
        assert!(s.check_entity("").is_err());
    }

    #[test]
    fn standard_set() {
        let secretaries = standard_secretaries();
        assert_eq!(secretaries.len(), 2);
        assert!(secretaries[LEADERSHIP_NAMESPACE].check_lease("mysql").is_ok());
        assert!(secretaries[SINGULAR_NAMESPACE].check_lease("mysql").is_err());
    }
}
