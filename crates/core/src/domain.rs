//! Virtual domains and lookup-path resolution.
//!
//! A virtual domain is the tenant identity behind one request host. It
//! carries an optional TLS key pair and an ordered set of lookup paths,
//! each mapping a URL prefix to one artifact source (a remote ZIP archive
//! or a filesystem path).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One prefix under a virtual domain mapping a URL subtree to an artifact
/// source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupPath {
    /// URL prefix, always starting and ending with `/` (the root is `/`).
    pub prefix: String,
    /// Artifact source: an archive URL (`http(s)://…`) or a filesystem path.
    pub source: String,
    /// Redirect cleartext requests for this path to HTTPS.
    #[serde(default)]
    pub https_only: bool,
    /// Requests under this path require an authenticated, authorized user.
    #[serde(default)]
    pub access_control: bool,
    /// Project the access check is performed against, when non-zero.
    #[serde(default)]
    pub project_id: u64,
}

impl LookupPath {
    /// The archive-relative source path, without its leading `/`.
    pub fn source_path(&self) -> &str {
        self.source.strip_prefix('/').unwrap_or(&self.source)
    }
}

/// Tenant identity selecting a set of serveable artifacts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VirtualDomain {
    /// Host this domain answers for.
    pub name: String,
    /// PEM certificate chain, when the tenant brought a certificate.
    #[serde(default)]
    pub certificate: Option<String>,
    /// PEM private key matching `certificate`.
    #[serde(default)]
    pub key: Option<String>,
    /// Lookup paths, resolution order defined by [`VirtualDomain::resolve`].
    #[serde(default)]
    pub lookup_paths: Vec<LookupPath>,
    /// Recorded ACME HTTP-01 challenge responses, `token -> key authorization`.
    #[serde(default)]
    pub acme_challenges: HashMap<String, String>,
}

/// Result of resolving a request path against a domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLookup<'a> {
    pub lookup: &'a LookupPath,
    /// Remainder of the request path after the matched prefix.
    pub request_path: String,
}

impl VirtualDomain {
    /// Select the lookup path for a request path.
    ///
    /// The longest prefix that is a prefix of `request_path` wins; among
    /// equal-length prefixes the lexicographically smaller one wins, so
    /// resolution is deterministic regardless of the order the source API
    /// returned the paths in.
    pub fn resolve(&self, request_path: &str) -> Result<ResolvedLookup<'_>> {
        let mut best: Option<&LookupPath> = None;

        for lookup in &self.lookup_paths {
            if !request_path.starts_with(&lookup.prefix) {
                continue;
            }

            best = match best {
                None => Some(lookup),
                Some(current) => {
                    let longer = lookup.prefix.len() > current.prefix.len();
                    let tie_break = lookup.prefix.len() == current.prefix.len()
                        && lookup.prefix < current.prefix;
                    if longer || tie_break {
                        Some(lookup)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        let lookup = best.ok_or(Error::NoLookupMatch)?;
        let request_path = request_path
            .strip_prefix(&lookup.prefix)
            .unwrap_or("")
            .to_string();

        Ok(ResolvedLookup {
            lookup,
            request_path,
        })
    }

    /// Whether this lookup path serves the domain root alongside project
    /// paths (a namespace project in GitLab terms).
    pub fn is_namespace_project(&self, lookup: &LookupPath) -> bool {
        lookup.prefix == "/" && self.lookup_paths.len() > 1
    }

    /// Whether any lookup path demands HTTPS for this request path.
    pub fn is_https_only(&self, request_path: &str) -> bool {
        self.resolve(request_path)
            .map(|r| r.lookup.https_only)
            .unwrap_or(false)
    }
}
