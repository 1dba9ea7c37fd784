//! Mapping changes of related objects back to the bootstrap they belong to.

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{runtime::reflector::ObjectRef, Resource, ResourceExt};

use crate::resources::{non_empty, Machine, RKEBootstrap, BOOTSTRAP_NAME_LABEL};

/// Service accounts generated for a bootstrap carry its name as a label.
pub fn from_service_account(sa: &ServiceAccount) -> Option<ObjectRef<RKEBootstrap>> {
    let name = non_empty(sa.labels(), BOOTSTRAP_NAME_LABEL)?;
    Some(ObjectRef::new(name).within(&sa.namespace()?))
}

/// Machines reference their bootstrap config.
pub fn from_machine(machine: &Machine) -> Option<ObjectRef<RKEBootstrap>> {
    let config_ref = machine.spec.bootstrap.config_ref.as_ref()?;
    if config_ref.kind.as_deref() != Some(RKEBootstrap::kind(&()).as_ref()) {
        return None;
    }
    let name = config_ref.name.as_deref().filter(|n| !n.is_empty())?;
    Some(ObjectRef::new(name).within(&machine.namespace()?))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ObjectReference;

    use super::*;
    use crate::resources::MachineSpec;

    fn machine(kind: &str, name: &str) -> Machine {
        let mut machine = Machine::new("m-1", MachineSpec::default());
        machine.metadata.namespace = Some("fleet-default".into());
        machine.spec.bootstrap.config_ref = Some(ObjectReference {
            kind: Some(kind.into()),
            name: Some(name.into()),
            ..Default::default()
        });
        machine
    }

    #[test]
    fn machine_maps_to_its_bootstrap() {
        let target = from_machine(&machine("RKEBootstrap", "custom-b")).unwrap();
        assert_eq!(target, ObjectRef::new("custom-b").within("fleet-default"));
    }

    #[test]
    fn other_bootstrap_providers_are_ignored() {
        assert!(from_machine(&machine("KubeadmConfig", "b")).is_none());
        assert!(from_machine(&Machine::new("m", MachineSpec::default())).is_none());
    }

    #[test]
    fn service_account_maps_through_label() {
        let mut sa = ServiceAccount::default();
        sa.metadata.name = Some("b-machine-plan".into());
        sa.metadata.namespace = Some("fleet-default".into());
        assert!(from_service_account(&sa).is_none());

        sa.metadata.labels = Some(BTreeMap::from([(BOOTSTRAP_NAME_LABEL.into(), "b".into())]));
        let target = from_service_account(&sa).unwrap();
        assert_eq!(target, ObjectRef::new("b").within("fleet-default"));
    }
}
