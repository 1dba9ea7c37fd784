use std::{env, time::Duration};

use crate::{Error, Result};

/// Operator settings, read from the environment
#[derive(Clone, Debug)]
pub struct Settings {
    /// URL nodes use to reach the server
    pub server_url: String,

    /// URL used instead of `server_url` when the server listens on a host port
    pub internal_server_url: Option<String>,

    /// Checksum of the server CA, handed to the node agent
    pub ca_checksum: Option<String>,

    /// Namespace and name of the server deployment probed for host ports
    pub system_namespace: String,
    pub server_deployment: String,

    /// Upper bound on a single etcd membership query
    pub etcd_probe_timeout: Duration,

    /// Instance name reported on events
    pub pod_name: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server_url = non_empty("CATTLE_SERVER_URL")
            .ok_or_else(|| Error::Config("missing CATTLE_SERVER_URL environment variable".into()))?;
        let etcd_probe_timeout = match non_empty("ETCD_PROBE_TIMEOUT_SECONDS") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|e| {
                Error::Config(format!("invalid ETCD_PROBE_TIMEOUT_SECONDS {raw:?}: {e}"))
            })?),
            None => Duration::from_secs(30),
        };

        Ok(Self {
            server_url: server_url.trim_end_matches('/').into(),
            internal_server_url: non_empty("CATTLE_INTERNAL_SERVER_URL")
                .map(|url| url.trim_end_matches('/').into()),
            ca_checksum: non_empty("CATTLE_CA_CHECKSUM"),
            system_namespace: non_empty("CATTLE_SYSTEM_NAMESPACE")
                .unwrap_or_else(|| "cattle-system".into()),
            server_deployment: non_empty("CATTLE_SERVER_DEPLOYMENT")
                .unwrap_or_else(|| "rancher".into()),
            etcd_probe_timeout,
            pod_name: non_empty("CONTROLLER_POD_NAME"),
        })
    }
}

#[cfg(test)]
impl Settings {
    pub(crate) fn for_tests() -> Self {
        Self {
            server_url: "https://rancher.example.com".into(),
            internal_server_url: None,
            ca_checksum: None,
            system_namespace: "cattle-system".into(),
            server_deployment: "rancher".into(),
            etcd_probe_timeout: Duration::from_secs(30),
            pod_name: None,
        }
    }
}
