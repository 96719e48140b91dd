//! Wire types of the internal pages API.

use pagoda_core::domain::{LookupPath, VirtualDomain};
use serde::Deserialize;
use std::collections::HashMap;

/// `GET /api/v4/internal/pages?host=<host>` response body.
#[derive(Clone, Debug, Deserialize)]
pub struct VirtualDomainResponse {
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub lookup_paths: Vec<LookupPathEntry>,
    #[serde(default)]
    pub acme_challenges: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LookupPathEntry {
    pub prefix: String,
    pub source: SourceEntry,
    #[serde(default)]
    pub https_only: bool,
    #[serde(default)]
    pub access_control: bool,
    #[serde(default)]
    pub project_id: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SourceEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

impl VirtualDomainResponse {
    /// Convert the wire shape into the core domain model.
    pub fn into_domain(self, host: &str) -> VirtualDomain {
        VirtualDomain {
            name: host.to_string(),
            certificate: self.certificate,
            key: self.key,
            lookup_paths: self
                .lookup_paths
                .into_iter()
                .map(|entry| LookupPath {
                    prefix: entry.prefix,
                    source: entry.source.path,
                    https_only: entry.https_only,
                    access_control: entry.access_control,
                    project_id: entry.project_id,
                })
                .collect(),
            acme_challenges: self.acme_challenges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_and_converts() {
        let body = serde_json::json!({
            "certificate": "CERT",
            "key": "KEY",
            "lookup_paths": [{
                "prefix": "/project/",
                "source": {"type": "zip", "path": "https://store/p.zip"},
                "https_only": true,
                "access_control": true,
                "project_id": 42
            }]
        });

        let response: VirtualDomainResponse = serde_json::from_value(body).unwrap();
        let domain = response.into_domain("group.pages.test");

        assert_eq!(domain.name, "group.pages.test");
        assert_eq!(domain.certificate.as_deref(), Some("CERT"));
        assert_eq!(domain.lookup_paths.len(), 1);
        let path = &domain.lookup_paths[0];
        assert_eq!(path.prefix, "/project/");
        assert_eq!(path.source, "https://store/p.zip");
        assert!(path.https_only);
        assert!(path.access_control);
        assert_eq!(path.project_id, 42);
    }

    #[test]
    fn missing_optional_fields_default() {
        let body = serde_json::json!({
            "lookup_paths": [{
                "prefix": "/",
                "source": {"type": "zip", "path": "https://store/p.zip"}
            }]
        });

        let response: VirtualDomainResponse = serde_json::from_value(body).unwrap();
        let domain = response.into_domain("x.test");
        assert!(domain.certificate.is_none());
        assert!(!domain.lookup_paths[0].access_control);
        assert_eq!(domain.lookup_paths[0].project_id, 0);
    }
}
