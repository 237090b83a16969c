use xds_api::pb::envoy::config::core::v3::Node;
use xds_api::pb::google::protobuf::value::Kind;

/// The node metadata key proxies use to pick their role.
pub const ROLE_METADATA_KEY: &str = "role";

/// What the server knows about a connected proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeInfo {
    pub id: String,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    pub role: Option<String>,
}

impl NodeInfo {
    pub(crate) fn from_node(node: &Node) -> Self {
        let (pod_name, namespace) = match node.id.split_once('.') {
            Some((pod, ns)) if !pod.is_empty() && !ns.is_empty() => {
                (Some(pod.to_string()), Some(ns.to_string()))
            }
            _ => (None, None),
        };

        Self {
            id: node.id.clone(),
            pod_name,
            namespace,
            role: role(node),
        }
    }
}

/// Map a proxy node to the role it serves.
///
/// Nodes with an empty id or without a string `role` in their metadata don't
/// have a role.
pub(crate) fn role(node: &Node) -> Option<String> {
    if node.id.is_empty() {
        return None;
    }

    let metadata = node.metadata.as_ref()?;
    match metadata.fields.get(ROLE_METADATA_KEY)?.kind.as_ref()? {
        Kind::StringValue(role) if !role.is_empty() => Some(role.clone()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use xds_api::pb::google::protobuf;

    pub(crate) fn node(id: &str, role: Option<&str>) -> Node {
        let metadata = role.map(|role| protobuf::Struct {
            fields: [(
                ROLE_METADATA_KEY.to_string(),
                protobuf::Value {
                    kind: Some(Kind::StringValue(role.to_string())),
                },
            )]
            .into_iter()
            .collect(),
        });

        Node {
            id: id.to_string(),
            metadata,
            ..Default::default()
        }
    }

    #[test]
    fn test_node_info() {
        let info = NodeInfo::from_node(&node("gateway-proxy-7c9f.gantry-system", Some("edge")));
        assert_eq!(info.pod_name.as_deref(), Some("gateway-proxy-7c9f"));
        assert_eq!(info.namespace.as_deref(), Some("gantry-system"));
        assert_eq!(info.role.as_deref(), Some("edge"));

        let info = NodeInfo::from_node(&node("standalone", Some("edge")));
        assert_eq!(info.pod_name, None);
        assert_eq!(info.role.as_deref(), Some("edge"));
    }

    #[test]
    fn test_missing_role() {
        assert_eq!(role(&node("proxy.ns", None)), None);
        assert_eq!(role(&node("proxy.ns", Some(""))), None);
        assert_eq!(role(&node("", Some("edge"))), None);

        let mut wrong_type = node("proxy.ns", None);
        wrong_type.metadata = Some(protobuf::Struct {
            fields: [(
                ROLE_METADATA_KEY.to_string(),
                protobuf::Value {
                    kind: Some(Kind::BoolValue(true)),
                },
            )]
            .into_iter()
            .collect(),
        });
        assert_eq!(role(&wrong_type), None);
    }
}
