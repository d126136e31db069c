// src/core/informer/key.rs

//! `InformerKey`: the four-tuple the registry uses to guarantee at most one
//! live informer per `(credential, cluster, kind)` (spec §3, testable
//! property #1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct InformerKey {
    pub credential_id: String,
    pub cluster_name: String,
    pub group: String,
    pub version: String,
    pub resource_plural: String,
}

impl InformerKey {
    pub fn new(
        credential_id: impl Into<String>,
        cluster_name: impl Into<String>,
        group: impl Into<String>,
        version: impl Into<String>,
        resource_plural: impl Into<String>,
    ) -> Self {
        Self {
            credential_id: credential_id.into(),
            cluster_name: cluster_name.into(),
            group: group.into(),
            version: version.into(),
            resource_plural: resource_plural.into(),
        }
    }
}

impl std::fmt::Display for InformerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.credential_id, self.cluster_name, self.group, self.version, self.resource_plural
        )
    }
}
