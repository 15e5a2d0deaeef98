//! Driver matching
//!
//! Maps every hardware id declared by any driver update to the declaring
//! update, then matches a client's reported hardware against it. Hardware
//! ids compare case-insensitively; the client reports them ordered most
//! specific first, and the first id that matches wins for a given driver.

use crate::identity::UpdateIdentity;
use crate::package::{Package, PackageKind};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Callback for drivers that matched a client but have no approving
/// deployment. They are reported here and left out of the response.
pub trait UnapprovedDriverObserver: Send + Sync {
    fn on_unapproved(&self, identity: &UpdateIdentity);
}

/// Observer that drops the notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl UnapprovedDriverObserver for NullObserver {
    fn on_unapproved(&self, _identity: &UpdateIdentity) {}
}

#[derive(Debug, Clone)]
struct DriverCandidate {
    guid: Uuid,
    /// Lower-cased computer hardware ids; empty means "matches any machine".
    computer_hardware_ids: Vec<String>,
}

/// Hardware-id index over the current-revision driver updates.
#[derive(Debug, Default)]
pub struct DriverMatcher {
    by_hardware_id: HashMap<String, Vec<DriverCandidate>>,
}

impl DriverMatcher {
    /// Build the index in one pass over the current-revision corpus.
    pub fn build(packages: &[Package]) -> Self {
        let mut by_hardware_id: HashMap<String, Vec<DriverCandidate>> = HashMap::new();
        for pkg in packages {
            if pkg.kind != PackageKind::Driver {
                continue;
            }
            for hw in &pkg.driver_ids {
                by_hardware_id
                    .entry(hw.hardware_id.to_ascii_lowercase())
                    .or_default()
                    .push(DriverCandidate {
                        guid: pkg.identity.guid,
                        computer_hardware_ids: hw
                            .computer_hardware_ids
                            .iter()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    });
            }
        }
        Self { by_hardware_id }
    }

    pub fn is_empty(&self) -> bool {
        self.by_hardware_id.is_empty()
    }

    /// Driver GUIDs matching the client's hardware, most specific match
    /// first, one entry per driver.
    ///
    /// When the client supplies computer hardware ids, a driver declaring
    /// any computer restriction must declare one of them; drivers declaring
    /// none always pass.
    pub fn matches(
        &self,
        hardware_ids: &[String],
        computer_hardware_ids: &[String],
    ) -> Vec<Uuid> {
        let machine: HashSet<String> = computer_hardware_ids
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();

        let mut seen = HashSet::new();
        let mut matched = Vec::new();
        for hw in hardware_ids {
            let Some(candidates) = self.by_hardware_id.get(&hw.to_ascii_lowercase()) else {
                continue;
            };
            for candidate in candidates {
                let machine_ok = candidate.computer_hardware_ids.is_empty()
                    || candidate
                        .computer_hardware_ids
                        .iter()
                        .any(|c| machine.contains(c));
                if machine_ok && seen.insert(candidate.guid) {
                    matched.push(candidate.guid);
                }
            }
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::DriverHardwareId;
    use bytes::Bytes;

    fn driver(guid: Uuid, ids: Vec<DriverHardwareId>) -> Package {
        Package {
            identity: UpdateIdentity::new(guid, 1),
            kind: PackageKind::Driver,
            title: None,
            kb_article: None,
            prerequisites: Vec::new(),
            bundled_with: Vec::new(),
            bundled_updates: Vec::new(),
            files: Vec::new(),
            driver_ids: ids,
            xml: Bytes::from_static(b"<Update/>"),
        }
    }

    fn hw(id: &str) -> DriverHardwareId {
        DriverHardwareId {
            hardware_id: id.into(),
            computer_hardware_ids: Vec::new(),
        }
    }

    #[test]
    fn test_most_specific_match_wins() {
        let specific = Uuid::new_v4();
        let generic = Uuid::new_v4();
        let matcher = DriverMatcher::build(&[
            driver(specific, vec![hw("PCI\\VEN_8086&DEV_1234&REV_02")]),
            driver(generic, vec![hw("PCI\\VEN_8086&DEV_1234")]),
        ]);

        let matched = matcher.matches(
            &[
                "PCI\\VEN_8086&DEV_1234&REV_02".into(),
                "PCI\\VEN_8086&DEV_1234".into(),
            ],
            &[],
        );
        assert_eq!(matched, vec![specific, generic]);
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let guid = Uuid::new_v4();
        let matcher = DriverMatcher::build(&[driver(guid, vec![hw("USB\\VID_046D&PID_C52B")])]);
        assert_eq!(
            matcher.matches(&["usb\\vid_046d&pid_c52b".into()], &[]),
            vec![guid]
        );
    }

    #[test]
    fn test_computer_hardware_restriction() {
        let restricted = Uuid::new_v4();
        let open = Uuid::new_v4();
        let matcher = DriverMatcher::build(&[
            driver(
                restricted,
                vec![DriverHardwareId {
                    hardware_id: "ACPI\\FAN01".into(),
                    computer_hardware_ids: vec!["vendor-x-model-7".into()],
                }],
            ),
            driver(open, vec![hw("ACPI\\FAN01")]),
        ]);

        // Machine declares nothing the restricted driver wants.
        let matched = matcher.matches(&["ACPI\\FAN01".into()], &["other-model".into()]);
        assert_eq!(matched, vec![open]);

        // Matching machine sees both.
        let matched = matcher.matches(&["ACPI\\FAN01".into()], &["vendor-x-model-7".into()]);
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_driver_matched_once_across_hardware_ids() {
        let guid = Uuid::new_v4();
        let matcher = DriverMatcher::build(&[driver(
            guid,
            vec![hw("PCI\\VEN_10DE&DEV_2484"), hw("PCI\\VEN_10DE")],
        )]);
        let matched = matcher.matches(
            &["PCI\\VEN_10DE&DEV_2484".into(), "PCI\\VEN_10DE".into()],
            &[],
        );
        assert_eq!(matched, vec![guid]);
    }
}
