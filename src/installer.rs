//! Node install scripts embedded in bootstrap secrets.

use indoc::formatdoc;
use kube::ResourceExt;

use crate::{
    config::Settings,
    resources::{EnvVar, Machine, OS_LABEL, WINDOWS_OS},
    Result,
};

/// Operating system family of a machine, picked from its OS label
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    pub fn of(machine: &Machine) -> Self {
        match machine.labels().get(OS_LABEL).map(String::as_str) {
            Some(WINDOWS_OS) => Self::Windows,
            _ => Self::Linux,
        }
    }
}

/// Everything a script needs to register a node with the server
#[derive(Clone, Debug)]
pub struct ScriptRequest<'a> {
    /// Encoded hash of the bootstrap service account token
    pub token: &'a str,
    pub env_vars: &'a [EnvVar],
    pub platform: Platform,
    /// The server is reachable through a host port on the node
    pub internal_api: bool,
}

/// Produces install scripts for machines
pub trait InstallScripts: Send + Sync {
    fn script(&self, request: &ScriptRequest<'_>) -> Result<Vec<u8>>;
}

/// Renders install scripts that fetch and run the system agent installer
#[derive(Clone, Debug)]
pub struct TemplateInstaller {
    server_url: String,
    internal_server_url: Option<String>,
    ca_checksum: Option<String>,
}

impl TemplateInstaller {
    pub fn new(settings: &Settings) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            internal_server_url: settings.internal_server_url.clone(),
            ca_checksum: settings.ca_checksum.clone(),
        }
    }

    fn server(&self, internal_api: bool) -> &str {
        match (&self.internal_server_url, internal_api) {
            (Some(internal), true) => internal,
            _ => &self.server_url,
        }
    }

    fn linux(&self, request: &ScriptRequest<'_>) -> String {
        let server = self.server(request.internal_api);
        let mut env = request
            .env_vars
            .iter()
            .map(|e| format!("{}=\"{}\"", e.name, shell_escape(&e.value)))
            .collect::<Vec<_>>();
        if let Some(checksum) = &self.ca_checksum {
            env.push(format!("CATTLE_CA_CHECKSUM=\"{checksum}\""));
        }

        formatdoc! {r#"
                #!/usr/bin/env sh
                set -e
                {env}
                CATTLE_SERVER="{server}"
                CATTLE_TOKEN="{token}"
                CATTLE_ROLE_NONE=true
                export {exports}

                curl --fail --silent --show-error --location "${{CATTLE_SERVER}}/system-agent-install.sh" | sh -s -
            "#,
            env = env.join("\n"),
            token = request.token,
            exports = exported_names(request.env_vars, self.ca_checksum.is_some(), &["CATTLE_SERVER", "CATTLE_TOKEN", "CATTLE_ROLE_NONE"]),
        }
    }

    fn windows(&self, request: &ScriptRequest<'_>) -> String {
        let server = self.server(request.internal_api);
        let mut env = request
            .env_vars
            .iter()
            .map(|e| format!("$env:{}=\"{}\"", e.name, powershell_escape(&e.value)))
            .collect::<Vec<_>>();
        if let Some(checksum) = &self.ca_checksum {
            env.push(format!("$env:CATTLE_CA_CHECKSUM=\"{checksum}\""));
        }

        formatdoc! {r#"
                $ErrorActionPreference = "Stop"
                {env}
                $env:CATTLE_SERVER="{server}"
                $env:CATTLE_TOKEN="{token}"
                $env:CATTLE_ROLE_NONE="true"

                Invoke-WebRequest -UseBasicParsing -Uri "$env:CATTLE_SERVER/wins-agent-install.ps1" -OutFile install.ps1
                ./install.ps1
            "#,
            env = env.join("\n"),
            token = request.token,
        }
    }
}

impl InstallScripts for TemplateInstaller {
    fn script(&self, request: &ScriptRequest<'_>) -> Result<Vec<u8>> {
        let script = match request.platform {
            Platform::Linux => self.linux(request),
            Platform::Windows => self.windows(request),
        };
        Ok(script.into_bytes())
    }
}

fn exported_names(env_vars: &[EnvVar], checksum: bool, fixed: &[&str]) -> String {
    let mut names: Vec<&str> = env_vars.iter().map(|e| e.name.as_str()).collect();
    if checksum {
        names.push("CATTLE_CA_CHECKSUM");
    }
    names.extend_from_slice(fixed);
    names.join(" ")
}

fn shell_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`")
}

fn powershell_escape(value: &str) -> String {
    value.replace('`', "``").replace('"', "`\"").replace('$', "`$")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::resources::MachineSpec;

    fn installer(internal: Option<&str>) -> TemplateInstaller {
        TemplateInstaller {
            server_url: "https://rancher.example.com".into(),
            internal_server_url: internal.map(Into::into),
            ca_checksum: Some("abc123".into()),
        }
    }

    fn render(installer: &TemplateInstaller, platform: Platform, internal_api: bool) -> String {
        let env = [EnvVar {
            name: "HTTP_PROXY".into(),
            value: "http://proxy:3128".into(),
        }];
        let bytes = installer
            .script(&ScriptRequest {
                token: "dG9rZW4=",
                env_vars: &env,
                platform,
                internal_api,
            })
            .unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn linux_script_exports_agent_settings() {
        let script = render(&installer(None), Platform::Linux, false);
        assert!(script.starts_with("#!/usr/bin/env sh\n"));
        assert!(script.contains("HTTP_PROXY=\"http://proxy:3128\"\n"));
        assert!(script.contains("CATTLE_SERVER=\"https://rancher.example.com\"\n"));
        assert!(script.contains("CATTLE_TOKEN=\"dG9rZW4=\"\n"));
        assert!(script.contains("CATTLE_CA_CHECKSUM=\"abc123\"\n"));
        assert!(script.contains(
            "export HTTP_PROXY CATTLE_CA_CHECKSUM CATTLE_SERVER CATTLE_TOKEN CATTLE_ROLE_NONE\n"
        ));
        assert!(script.contains("\"${CATTLE_SERVER}/system-agent-install.sh\""));
    }

    #[test]
    fn windows_script_uses_powershell() {
        let script = render(&installer(None), Platform::Windows, false);
        assert!(script.contains("$env:HTTP_PROXY=\"http://proxy:3128\""));
        assert!(script.contains("$env:CATTLE_TOKEN=\"dG9rZW4=\""));
        assert!(script.contains("wins-agent-install.ps1"));
    }

    #[test]
    fn host_port_deployments_use_internal_server() {
        let installer = installer(Some("https://127.0.0.1:6443"));
        assert!(render(&installer, Platform::Linux, true).contains("CATTLE_SERVER=\"https://127.0.0.1:6443\""));
        assert!(render(&installer, Platform::Linux, false).contains("CATTLE_SERVER=\"https://rancher.example.com\""));
    }

    #[test]
    fn platform_follows_os_label() {
        let mut machine = Machine::new("m", MachineSpec::default());
        assert_eq!(Platform::of(&machine), Platform::Linux);
        machine.metadata.labels = Some(BTreeMap::from([(OS_LABEL.into(), WINDOWS_OS.into())]));
        assert_eq!(Platform::of(&machine), Platform::Windows);
    }

    #[test]
    fn values_are_escaped() {
        assert_eq!(shell_escape(r#"a"$b"#), r#"a\"\$b"#);
        assert_eq!(powershell_escape(r#"a"$b"#), r#"a`"`$b"#);
    }
}
