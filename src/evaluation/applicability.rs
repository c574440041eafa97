//! Which KPI definitions apply to which device instances.

use crate::model::{KpiDefinition, SdInstance, SdInstanceMode};

/// Whether `definition` applies to `instance`.
///
/// The instance must be of the targeted device type and, in `Selected` mode,
/// its UID must be one of the selected UIDs. Non-applicable pairs take no part
/// in any statistic.
pub fn applies(definition: &KpiDefinition, instance: &SdInstance) -> bool {
    if instance.sd_type.id != definition.sd_type_id {
        return false;
    }
    match definition.sd_instance_mode {
        SdInstanceMode::All => true,
        SdInstanceMode::Selected => definition
            .selected_sd_instance_uids
            .iter()
            .any(|uid| *uid == instance.uid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SdTypeRef;

    fn instance(uid: &str, type_id: u32) -> SdInstance {
        SdInstance {
            id: 1,
            uid: uid.to_string(),
            user_identifier: uid.to_uppercase(),
            confirmed_by_user: true,
            sd_type: SdTypeRef { id: type_id },
            parameter_snapshots: Vec::new(),
        }
    }

    fn definition(mode: SdInstanceMode, selected: &[&str]) -> KpiDefinition {
        KpiDefinition {
            id: Some(1),
            user_identifier: "Temperature OK".to_string(),
            sd_type_id: 7,
            sd_type_specification: "boiler".to_string(),
            sd_instance_mode: mode,
            selected_sd_instance_uids: selected.iter().map(|s| s.to_string()).collect(),
            nodes: Vec::new(),
        }
    }

    #[test]
    fn test_all_mode_matches_type_only() {
        let def = definition(SdInstanceMode::All, &[]);
        assert!(applies(&def, &instance("a", 7)));
        assert!(applies(&def, &instance("b", 7)));
        assert!(!applies(&def, &instance("a", 8)));
    }

    #[test]
    fn test_selected_mode_requires_listed_uid() {
        let def = definition(SdInstanceMode::Selected, &["a"]);
        assert!(applies(&def, &instance("a", 7)));
        assert!(!applies(&def, &instance("b", 7)));
    }

    #[test]
    fn test_selected_mode_still_checks_type() {
        let def = definition(SdInstanceMode::Selected, &["a"]);
        assert!(!applies(&def, &instance("a", 8)));
    }

    #[test]
    fn test_selected_mode_with_empty_selection() {
        let def = definition(SdInstanceMode::Selected, &[]);
        assert!(!applies(&def, &instance("a", 7)));
    }

    #[test]
    fn test_uids_ignored_in_all_mode() {
        let def = definition(SdInstanceMode::All, &["z"]);
        assert!(applies(&def, &instance("a", 7)));
    }
}
