use sha2::{Digest, Sha256};

const MAX_NAME_LENGTH: usize = 63;

/// Join name parts with `-`, keeping the result a valid DNS label.
///
/// Names that would exceed 63 characters are cut and suffixed with a short
/// hash of the full name so that distinct inputs stay distinct.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }

    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    // A cut may leave a trailing character that is not allowed at the end of a label
    let c = full.as_bytes()[56];
    if c.is_ascii_lowercase() || c.is_ascii_digit() {
        format!("{}-{}", &full[..57], &digest[..5])
    } else {
        format!("{}-{}", &full[..56], &digest[..6])
    }
}

pub fn plan_secret_name(bootstrap: &str) -> String {
    safe_concat_name(&[bootstrap, "machine", "plan"])
}

pub fn bootstrap_secret_name(bootstrap: &str) -> String {
    safe_concat_name(&[bootstrap, "machine", "bootstrap"])
}

pub fn token_secret_name(service_account: &str) -> String {
    safe_concat_name(&[service_account, "token"])
}

/// Secret holding the admin kubeconfig of a Cluster API cluster.
pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{cluster}-kubeconfig")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_joined() {
        assert_eq!(plan_secret_name("custom-abc"), "custom-abc-machine-plan");
        assert_eq!(bootstrap_secret_name("b"), "b-machine-bootstrap");
        assert_eq!(kubeconfig_secret_name("prod"), "prod-kubeconfig");
    }

    #[test]
    fn long_names_are_truncated_with_hash() {
        let long = "a".repeat(70);
        let name = plan_secret_name(&long);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with(&"a".repeat(57)));
        assert_eq!(name.as_bytes()[57], b'-');
        // stable across calls
        assert_eq!(name, plan_secret_name(&long));
        assert_ne!(name, bootstrap_secret_name(&long));
    }

    #[test]
    fn truncation_avoids_trailing_dash() {
        // position 56 is a separator
        let prefix = format!("{}-{}", "a".repeat(56), "b".repeat(20));
        let name = safe_concat_name(&[&prefix]);
        assert_eq!(name.len(), 63);
        assert_eq!(&name[..56], &"a".repeat(56));
        assert_eq!(name.as_bytes()[56], b'-');
    }
}
