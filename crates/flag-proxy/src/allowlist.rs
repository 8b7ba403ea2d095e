//! Static allow-list of caller applications.
//!
//! Built once at startup from inline config and/or a NAIS application
//! manifest, then shared read-only.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::config::AccessConfig;

#[derive(thiserror::Error, Debug)]
pub enum AllowListError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no allowed caller applications configured")]
    Empty,
}

/// Ordered, duplicate-free set of caller identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    callers: Vec<String>,
}

/// The slice of a NAIS manifest we care about:
/// `spec.accessPolicy.inbound.rules[].application`.
#[derive(Deserialize)]
struct Manifest {
    spec: ManifestSpec,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestSpec {
    #[serde(default)]
    access_policy: AccessPolicy,
}

#[derive(Deserialize, Default)]
struct AccessPolicy {
    #[serde(default)]
    inbound: InboundPolicy,
}

#[derive(Deserialize, Default)]
struct InboundPolicy {
    #[serde(default)]
    rules: Vec<InboundRule>,
}

#[derive(Deserialize)]
struct InboundRule {
    #[serde(default)]
    application: String,
}

impl AllowList {
    /// Build from any list of names. Empty names are skipped and duplicates
    /// keep their first position.
    pub fn new<I, S>(callers: I) -> Result<Self, AllowListError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for caller in callers {
            let caller = caller.into().trim().to_string();
            if !caller.is_empty() && !unique.contains(&caller) {
                unique.push(caller);
            }
        }

        if unique.is_empty() {
            return Err(AllowListError::Empty);
        }

        Ok(Self { callers: unique })
    }

    /// Combine the manifest's inbound rules (if configured) with the inline list.
    pub fn from_config(access: &AccessConfig) -> Result<Self, AllowListError> {
        let mut callers = match &access.manifest_path {
            Some(path) => read_manifest(path)?,
            None => Vec::new(),
        };
        callers.extend(access.allowed_callers.iter().cloned());
        Self::new(callers)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.callers.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.callers.join(", "))
    }
}

fn read_manifest(path: &Path) -> Result<Vec<String>, AllowListError> {
    let raw = std::fs::read_to_string(path).map_err(|source| AllowListError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_manifest(&raw)
}

fn parse_manifest(raw: &str) -> Result<Vec<String>, AllowListError> {
    let manifest: Manifest = serde_yaml::from_str(raw)?;
    Ok(manifest
        .spec
        .access_policy
        .inbound
        .rules
        .into_iter()
        .map(|rule| rule.application)
        .filter(|app| !app.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"
apiVersion: nais.io/v1alpha1
kind: Application
metadata:
  name: flag-proxy
  namespace: klage
spec:
  image: "{{ image }}"
  accessPolicy:
    inbound:
      rules:
        - application: kabal-frontend
        - application: kabal-api
        - application: ""
        - application: klage-dittnav-api
    outbound:
      external:
        - host: unleash.example.com
"#;

    #[test]
    fn test_dedup_preserves_first_position() {
        let list = AllowList::new(["app2", "app1", "app2", " ", "app3"]).unwrap();
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["app2", "app1", "app3"]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.to_string(), "app2, app1, app3");
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(matches!(
            AllowList::new(Vec::<String>::new()),
            Err(AllowListError::Empty)
        ));
        assert!(matches!(AllowList::new([""]), Err(AllowListError::Empty)));
    }

    #[test]
    fn test_manifest_inbound_rules() {
        let apps = parse_manifest(MANIFEST).unwrap();
        assert_eq!(apps, vec!["kabal-frontend", "kabal-api", "klage-dittnav-api"]);
    }

    #[test]
    fn test_manifest_without_access_policy_yields_nothing() {
        let apps = parse_manifest("spec:\n  image: foo\n").unwrap();
        assert!(apps.is_empty());
    }

    #[test]
    fn test_from_config_merges_manifest_and_inline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();

        let access = AccessConfig {
            allowed_callers: vec!["kabal-api".to_string(), "local-dev".to_string()],
            manifest_path: Some(file.path().to_path_buf()),
        };
        let list = AllowList::from_config(&access).unwrap();
        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec!["kabal-frontend", "kabal-api", "klage-dittnav-api", "local-dev"]
        );
    }

    #[test]
    fn test_missing_manifest_file() {
        let access = AccessConfig {
            allowed_callers: vec![],
            manifest_path: Some("/nonexistent/nais.yaml".into()),
        };
        assert!(matches!(
            AllowList::from_config(&access),
            Err(AllowListError::Read { .. })
        ));
    }
}
