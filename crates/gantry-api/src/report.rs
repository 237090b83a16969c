use crate::shared::{impl_resource, Metadata, ResourceKind, ResourceRef};
use serde::{Deserialize, Serialize};

/// The validation status of a single configuration object.
///
/// Reports are written by the control plane. There is at most one report per
/// object that isn't qualified by a role, and at most one per object per role.
/// Global reports are stored under `<kind>-<object-name>` so objects of
/// different kinds can share a name, role reports under
/// `<role>-<object-name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Report {
    pub metadata: Metadata,

    /// The kind of object this report describes.
    pub kind: ResourceKind,

    /// The object this report describes.
    pub object_ref: ResourceRef,

    pub state: ReportState,

    /// Why the object was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Problems that did not cause the object to be rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// The role this report applies to. Global reports have no role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl_resource!(Report, ResourceKind::Report);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportState {
    Accepted,
    Rejected,
}

impl Report {
    pub fn accepted(kind: ResourceKind, object_ref: ResourceRef) -> Self {
        let name = format!("{}-{}", kind.to_string().to_lowercase(), object_ref.name);
        Self {
            metadata: Metadata::new(&object_ref.namespace, &name),
            kind,
            object_ref,
            state: ReportState::Accepted,
            reason: None,
            warnings: Vec::new(),
            role: None,
        }
    }

    pub fn rejected(kind: ResourceKind, object_ref: ResourceRef, reason: impl Into<String>) -> Self {
        Self {
            state: ReportState::Rejected,
            reason: Some(reason.into()),
            ..Self::accepted(kind, object_ref)
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.state == ReportState::Rejected
    }

    /// Qualify this report with a role. Role reports are stored under the name
    /// `<role>-<object-name>`.
    pub fn for_role(mut self, role: &str) -> Self {
        self.metadata.name = format!("{role}-{}", self.object_ref.name);
        self.role = Some(role.to_string());
        self
    }

    /// Returns `true` if this report has the same content as `other`, ignoring
    /// the resource version assigned by storage.
    pub fn same_content(&self, other: &Report) -> bool {
        let mut other = other.clone();
        other.metadata.resource_version.clone_from(&self.metadata.resource_version);
        self == &other
    }
}
