//! Cluster access: client bootstrap, dynamic object plumbing and the mapping
//! from API server failures to the errno values the filesystem layer returns.

pub mod discovery;

use anyhow::{Context, Result, bail};
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject};
use serde_json::{Value, json};

/// Identity of a served kind: (group, version, plural) plus the details the
/// filesystem needs to name files and address the API.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KindRef {
    /// API group; empty for the core group.
    pub group: String,
    pub version: String,
    /// Kind name as served (e.g. `Pod`).
    pub kind: String,
    /// Plural resource name (e.g. `pods`).
    pub plural: String,
    pub namespaced: bool,
}

impl KindRef {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// `group/version/plural` with the core group spelled out, for logs.
    pub fn gvr(&self) -> String {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        format!("{}/{}/{}", group, self.version, self.plural)
    }
}

/// Compact resource reference used in log lines, e.g. `core/v1/Pod/x/web`.
pub fn log_ref(kind: &KindRef, dir: &str, name: &str) -> String {
    let group = if kind.group.is_empty() {
        "core"
    } else {
        &kind.group
    };
    format!("{}/{}/{}/{}/{}", group, kind.version, kind.kind, dir, name)
}

/// Bootstrap the cluster client from the ambient kubeconfig/in-cluster
/// environment.
pub async fn connect() -> Result<Client> {
    Client::try_default()
        .await
        .context("failed to initialize cluster client")
}

/// Dynamic API handle for one kind, namespaced when a namespace is given.
pub fn dynamic_api(client: &Client, kind: &KindRef, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = kind.api_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
        None => Api::all_with(client.clone(), &ar),
    }
}

/// Errno for a failed cluster call, per the error table: forbidden is an
/// access problem, invalid objects are the caller's fault, everything else is
/// an I/O failure.
pub fn errno_for(err: &kube::Error) -> libc::c_int {
    match err {
        kube::Error::Api(resp) => match resp.reason.as_str() {
            "Forbidden" => libc::EACCES,
            "Invalid" | "BadRequest" => libc::EINVAL,
            _ => match resp.code {
                403 => libc::EACCES,
                400 | 422 => libc::EINVAL,
                _ => libc::EIO,
            },
        },
        _ => libc::EIO,
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404 || resp.reason == "NotFound")
}

/// Serialize a fetched object to the YAML the file presents, dropping
/// server-managed metadata unless configured otherwise.
pub fn to_yaml(obj: &DynamicObject, show_managed_fields: bool) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(obj).context("failed to encode object")?;
    if !show_managed_fields {
        strip_managed_fields(&mut value);
    }
    let yaml = serde_yaml::to_string(&value).context("failed to render YAML")?;
    Ok(yaml.into_bytes())
}

pub fn strip_managed_fields(value: &mut Value) {
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("managedFields");
    }
}

/// Decode an edited buffer into the object to apply.
///
/// Fills in the kind identity, name and namespace from the file's identity
/// when the manifest leaves them out, and rejects manifests that disagree
/// with the file they were written to.
pub fn prepare_manifest(
    data: &[u8],
    kind: &KindRef,
    name: &str,
    namespace: Option<&str>,
    show_managed_fields: bool,
) -> Result<DynamicObject> {
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        bail!("empty manifest");
    }
    let mut value: Value = serde_yaml::from_slice(data).context("manifest is not valid YAML")?;
    let Some(root) = value.as_object_mut() else {
        bail!("manifest is not a mapping");
    };

    let has_identity = ["apiVersion", "kind"].iter().all(|key| {
        root.get(*key)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    });
    if !has_identity {
        root.insert("apiVersion".to_string(), json!(kind.api_version()));
        root.insert("kind".to_string(), json!(kind.kind));
    }

    let metadata = root
        .entry("metadata".to_string())
        .or_insert_with(|| json!({}));
    let Some(metadata) = metadata.as_object_mut() else {
        bail!("manifest metadata is not a mapping");
    };

    match metadata.get("name").and_then(Value::as_str) {
        None | Some("") => {
            metadata.insert("name".to_string(), json!(name));
        }
        Some(actual) if actual != name => {
            bail!("name mismatch: expected {name}, got {actual}");
        }
        Some(_) => {}
    }

    match namespace {
        None => {
            metadata.remove("namespace");
        }
        Some(expected) => match metadata.get("namespace").and_then(Value::as_str) {
            None | Some("") => {
                metadata.insert("namespace".to_string(), json!(expected));
            }
            Some(actual) if actual != expected => {
                bail!("namespace mismatch: expected {expected}, got {actual}");
            }
            Some(_) => {}
        },
    }

    if !show_managed_fields {
        strip_managed_fields(&mut value);
    }

    serde_json::from_value(value).context("manifest does not decode as an object")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn pod_kind() -> KindRef {
        KindRef {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Pod".to_string(),
            plural: "pods".to_string(),
            namespaced: true,
        }
    }

    fn node_kind() -> KindRef {
        KindRef {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Node".to_string(),
            plural: "nodes".to_string(),
            namespaced: false,
        }
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn api_version_spells_core_group() {
        assert_eq!(pod_kind().api_version(), "v1");
        let deploy = KindRef {
            group: "apps".to_string(),
            version: "v1".to_string(),
            kind: "Deployment".to_string(),
            plural: "deployments".to_string(),
            namespaced: true,
        };
        assert_eq!(deploy.api_version(), "apps/v1");
        assert_eq!(deploy.gvr(), "apps/v1/deployments");
        assert_eq!(pod_kind().gvr(), "core/v1/pods");
    }

    #[test]
    fn log_ref_is_compact() {
        assert_eq!(log_ref(&pod_kind(), "x", "web"), "core/v1/Pod/x/web");
    }

    #[test]
    fn errno_mapping_follows_reason() {
        assert_eq!(errno_for(&api_error(403, "Forbidden")), libc::EACCES);
        assert_eq!(errno_for(&api_error(422, "Invalid")), libc::EINVAL);
        assert_eq!(errno_for(&api_error(500, "InternalError")), libc::EIO);
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(403, "Forbidden")));
    }

    #[test]
    fn prepare_fills_identity_and_namespace() {
        let obj = prepare_manifest(
            b"metadata:\n  labels:\n    app: web\n",
            &pod_kind(),
            "web",
            Some("x"),
            false,
        )
        .unwrap();
        let types = obj.types.clone().unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "Pod");
        assert_eq!(obj.metadata.name.as_deref(), Some("web"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("x"));
    }

    #[test]
    fn prepare_rejects_name_mismatch() {
        let err = prepare_manifest(
            b"metadata:\n  name: other\n",
            &pod_kind(),
            "web",
            Some("x"),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("name mismatch"));
    }

    #[test]
    fn prepare_rejects_namespace_mismatch() {
        let err = prepare_manifest(
            b"metadata:\n  name: web\n  namespace: y\n",
            &pod_kind(),
            "web",
            Some("x"),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("namespace mismatch"));
    }

    #[test]
    fn prepare_clears_namespace_for_cluster_scoped() {
        let obj = prepare_manifest(
            b"metadata:\n  name: worker-1\n  namespace: x\n",
            &node_kind(),
            "worker-1",
            None,
            false,
        )
        .unwrap();
        assert_eq!(obj.metadata.namespace, None);
    }

    #[test]
    fn prepare_rejects_empty_manifest() {
        assert!(prepare_manifest(b"", &pod_kind(), "web", Some("x"), false).is_err());
        assert!(prepare_manifest(b"  \n \n", &pod_kind(), "web", Some("x"), false).is_err());
    }

    #[test]
    fn prepare_strips_managed_fields_unless_shown() {
        let data = concat!(
            "metadata:\n",
            "  name: web\n",
            "  managedFields:\n",
            "    - manager: kubectl\n",
        )
        .as_bytes();
        let stripped = prepare_manifest(data, &pod_kind(), "web", Some("x"), false).unwrap();
        assert!(stripped.metadata.managed_fields.is_none());
        let kept = prepare_manifest(data, &pod_kind(), "web", Some("x"), true).unwrap();
        assert!(kept.metadata.managed_fields.is_some());
    }

    #[test]
    fn yaml_round_trip_strips_managed_fields() {
        let data = concat!(
            "apiVersion: v1\n",
            "kind: Pod\n",
            "metadata:\n",
            "  name: web\n",
            "  namespace: x\n",
            "  managedFields:\n",
            "    - manager: kubectl\n",
        )
        .as_bytes();
        let obj = prepare_manifest(data, &pod_kind(), "web", Some("x"), true).unwrap();
        let yaml = String::from_utf8(to_yaml(&obj, false).unwrap()).unwrap();
        assert!(!yaml.contains("managedFields"));
        let yaml = String::from_utf8(to_yaml(&obj, true).unwrap()).unwrap();
        assert!(yaml.contains("managedFields"));
    }
}
