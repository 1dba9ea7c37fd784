//! Objects generated for a bootstrap.
//!
//! Everything here is a pure function of its inputs; reads and writes against
//! the store happen in the reconciler.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE, Engine};
use k8s_openapi::{
    api::{
        core::v1::{Secret, ServiceAccount},
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    ByteString,
};
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::{
    apply::DesiredSet,
    names::{bootstrap_secret_name, plan_secret_name, token_secret_name},
    resources::*,
};

/// Verbs the plan service account holds on its own plan secret.
const PLAN_SECRET_VERBS: [&str; 4] = ["watch", "get", "update", "list"];

/// Key of the install payload inside a bootstrap secret.
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// Key of the bearer token inside a service account token secret.
pub const TOKEN_KEY: &str = "token";

fn owned_by(bootstrap: &RKEBootstrap) -> Vec<OwnerReference> {
    bootstrap
        .controller_owner_ref(&())
        .map(|owner| OwnerReference {
            block_owner_deletion: Some(true),
            ..owner
        })
        .into_iter()
        .collect()
}

/// Service account, secret and access binding through which a joined node keeps
/// fetching its plan.
pub fn plan_objects(machine: &Machine, bootstrap: &RKEBootstrap) -> DesiredSet {
    let name = plan_secret_name(&bootstrap.name_any());
    let namespace = bootstrap.namespace();

    let service_account = ServiceAccount {
        metadata: meta! {
            owners: owned_by(bootstrap),
            name: Some(name.clone()),
            namespace: namespace.clone(),
            labels: Some(labels! {
                MACHINE_NAME_LABEL => machine.name_any(),
                BOOTSTRAP_NAME_LABEL => bootstrap.name_any(),
                ROLE_LABEL => ROLE_PLAN,
                PLAN_SECRET_LABEL => name,
            }),
        },
        ..Default::default()
    };

    let cluster_name = match bootstrap.spec.cluster_name.as_str() {
        "" => machine.spec.cluster_name.clone(),
        name => name.to_string(),
    };
    let mut secret_labels = labels! {
        MACHINE_NAME_LABEL => machine.name_any(),
        CLUSTER_NAME_LABEL => cluster_name,
    };
    secret_labels.extend(bootstrap.labels().clone());
    let secret = Secret {
        metadata: meta! {
            owners: owned_by(bootstrap),
            name: Some(name.clone()),
            namespace: namespace.clone(),
            labels: Some(secret_labels),
            annotations: Some(bootstrap.annotations().clone()).filter(|a| !a.is_empty()),
        },
        type_: Some(SECRET_TYPE_MACHINE_PLAN.into()),
        ..Default::default()
    };

    let role = Role {
        metadata: meta! {
            owners: owned_by(bootstrap),
            name: Some(name.clone()),
            namespace: namespace.clone(),
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["".into()]),
            resources: Some(vec!["secrets".into()]),
            resource_names: Some(vec![name.clone()]),
            verbs: PLAN_SECRET_VERBS.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }]),
    };

    let role_binding = RoleBinding {
        metadata: meta! {
            owners: owned_by(bootstrap),
            name: Some(name.clone()),
            namespace: namespace.clone(),
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name,
            namespace,
            ..Default::default()
        }]),
    };

    DesiredSet {
        service_accounts: vec![service_account],
        secrets: vec![secret],
        roles: vec![role],
        role_bindings: vec![role_binding],
    }
}

/// Service account whose token registers a node during its first join.
pub fn bootstrap_service_account(machine: &Machine, bootstrap: &RKEBootstrap) -> ServiceAccount {
    ServiceAccount {
        metadata: meta! {
            owners: owned_by(bootstrap),
            name: Some(bootstrap_secret_name(&bootstrap.name_any())),
            namespace: bootstrap.namespace(),
            labels: Some(labels! {
                MACHINE_NAME_LABEL => machine.name_any(),
                BOOTSTRAP_NAME_LABEL => bootstrap.name_any(),
                ROLE_LABEL => ROLE_BOOTSTRAP,
            }),
        },
        ..Default::default()
    }
}

/// Secret carrying the install script for a machine.
pub fn bootstrap_secret(machine: &Machine, bootstrap: &RKEBootstrap, script: Vec<u8>) -> Secret {
    Secret {
        metadata: meta! {
            owners: owned_by(bootstrap),
            name: Some(bootstrap_secret_name(&bootstrap.name_any())),
            namespace: bootstrap.namespace(),
            labels: Some(labels! {
                MACHINE_NAME_LABEL => machine.name_any(),
            }),
        },
        type_: Some(SECRET_TYPE_BOOTSTRAP.into()),
        data: Some(BTreeMap::from([(BOOTSTRAP_DATA_KEY.to_string(), ByteString(script))])),
        ..Default::default()
    }
}

/// Token secret that asks the cluster to issue a credential for a service account.
///
/// Returns `None` for a service account that has not been stored yet.
pub fn token_secret(service_account: &ServiceAccount) -> Option<Secret> {
    let owner = service_account.controller_owner_ref(&())?;
    Some(Secret {
        metadata: meta! {
            owners: vec![owner],
            name: Some(token_secret_name(&service_account.name_any())),
            namespace: service_account.namespace(),
            annotations: Some(labels! {
                SERVICE_ACCOUNT_NAME_ANNOTATION => service_account.name_any(),
            }),
        },
        type_: Some(SECRET_TYPE_SERVICE_ACCOUNT_TOKEN.into()),
        ..Default::default()
    })
}

/// The populated token of a token secret.
pub fn token_of(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()?
        .get(TOKEN_KEY)
        .map(|t| t.0.as_slice())
        .filter(|t| !t.is_empty())
}

/// What a node presents instead of the raw token: its SHA-256, URL-safe base64.
pub fn token_hash(token: &[u8]) -> String {
    URL_SAFE.encode(Sha256::digest(token))
}
