//! Image configuration as written by `docker save`.
//!
//! Only the fields that carry over into an OCI image configuration are
//! modelled. Docker writes `null` for many unset fields, so nearly
//! everything is optional here.

use crate::error::ConvertError;
use anyhow::{Context, Result};
use chrono::DateTime;
use oci_spec::image::History;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyImageConfig {
    /// RFC 3339 timestamp, kept as written so the translated config
    /// carries the exact same text.
    #[serde(default, deserialize_with = "rfc3339")]
    pub created: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    /// Configuration of the container the image was committed from.
    #[serde(default)]
    pub container_config: Option<ContainerConfig>,
    #[serde(default, rename = "Size", skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default)]
    pub rootfs: Option<RootFs>,
    #[serde(default)]
    pub history: Option<Vec<History>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default, rename = "User")]
    pub user: Option<String>,
    #[serde(default, rename = "ExposedPorts")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, rename = "Env")]
    pub env: Option<Vec<String>>,
    #[serde(default, rename = "Cmd")]
    pub cmd: Option<StrSlice>,
    #[serde(default, rename = "Volumes")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, rename = "WorkingDir")]
    pub working_dir: Option<String>,
    #[serde(default, rename = "Entrypoint")]
    pub entrypoint: Option<StrSlice>,
    #[serde(default, rename = "Labels")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default, rename = "StopSignal")]
    pub stop_signal: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub diff_ids: Option<Vec<String>>,
}

impl RootFs {
    pub fn diff_ids(&self) -> &[String] {
        self.diff_ids.as_deref().unwrap_or_default()
    }
}

fn rfc3339<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    if let Some(created) = &value {
        DateTime::parse_from_rfc3339(created)
            .map_err(|e| de::Error::custom(format!("invalid created time {created:?}: {e}")))?;
    }
    Ok(value)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    List(Vec<String>),
    Single(String),
}

/// A command line given either as a JSON array or as a bare string.
///
/// A bare string becomes a one-element list. `null` and a missing key never
/// reach this type: they leave the surrounding `Option` as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StringOrList")]
pub struct StrSlice(pub Vec<String>);

impl From<StringOrList> for StrSlice {
    fn from(value: StringOrList) -> Self {
        match value {
            StringOrList::List(items) => StrSlice(items),
            StringOrList::Single(item) => StrSlice(vec![item]),
        }
    }
}

impl From<StrSlice> for Vec<String> {
    fn from(value: StrSlice) -> Self {
        value.0
    }
}

impl LegacyImageConfig {
    pub fn from_json(content: &[u8]) -> Result<Self> {
        let config: LegacyImageConfig =
            serde_json::from_slice(content).context("Failed to parse image configuration")?;
        if config.rootfs.is_none() {
            return Err(ConvertError::MissingRootFs.into());
        }
        Ok(config)
    }

    pub fn rootfs(&self) -> Result<&RootFs> {
        self.rootfs
            .as_ref()
            .ok_or_else(|| ConvertError::MissingRootFs.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER_CONFIG: &str = r##"{
        "architecture": "amd64",
        "os": "linux",
        "created": "2024-03-01T10:20:30.123456789Z",
        "author": "someone@example.com",
        "container_config": {
            "User": "app",
            "ExposedPorts": {"8080/tcp": {}, "53/udp": {}},
            "Env": ["PATH=/usr/bin:/bin", "APP_ENV=prod"],
            "Cmd": ["/bin/sh", "-c", "#(nop) ", "CMD [\"serve\"]"],
            "Volumes": {"/data": {}},
            "WorkingDir": "/srv",
            "Entrypoint": null,
            "Labels": {"maintainer": "team"},
            "StopSignal": "SIGTERM",
            "OnBuild": null
        },
        "config": {"Cmd": ["serve"]},
        "rootfs": {
            "type": "layers",
            "diff_ids": [
                "sha256:1111111111111111111111111111111111111111111111111111111111111111"
            ]
        },
        "history": [
            {"created": "2024-03-01T10:20:30Z", "created_by": "/bin/sh -c #(nop) ADD file:abc in /"},
            {"created": "2024-03-01T10:20:31Z", "created_by": "/bin/sh -c #(nop) CMD [\"serve\"]", "empty_layer": true}
        ],
        "Size": 1234
    }"##;

    #[test]
    fn test_parse_docker_config() {
        let config = LegacyImageConfig::from_json(DOCKER_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.architecture, "amd64");
        assert_eq!(config.os, "linux");
        assert_eq!(config.author.as_deref(), Some("someone@example.com"));
        assert_eq!(config.size, Some(1234));

        let cc = config.container_config.as_ref().unwrap();
        assert_eq!(cc.user.as_deref(), Some("app"));
        assert_eq!(cc.env.as_ref().unwrap().len(), 2);
        assert_eq!(cc.cmd.as_ref().unwrap().0.len(), 4);
        assert!(cc.entrypoint.is_none());
        assert_eq!(cc.working_dir.as_deref(), Some("/srv"));
        assert_eq!(cc.stop_signal.as_deref(), Some("SIGTERM"));
        assert!(cc.exposed_ports.as_ref().unwrap().contains_key("8080/tcp"));
        assert!(cc.volumes.as_ref().unwrap().contains_key("/data"));

        assert_eq!(config.rootfs().unwrap().typ, "layers");
        assert_eq!(config.rootfs().unwrap().diff_ids().len(), 1);
        assert_eq!(config.history.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_rootfs_is_fatal() {
        let err = LegacyImageConfig::from_json(br#"{"architecture": "amd64", "os": "linux"}"#)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConvertError>(),
            Some(ConvertError::MissingRootFs)
        ));
    }

    #[test]
    fn test_malformed_json_is_fatal() {
        assert!(LegacyImageConfig::from_json(b"{\"rootfs\": ").is_err());
        let bad_time = br#"{"created": "yesterday", "rootfs": {"type": "layers"}}"#;
        assert!(LegacyImageConfig::from_json(bad_time).is_err());
    }

    #[test]
    fn test_created_kept_verbatim() {
        for created in ["2024-03-01T10:20:30.5Z", "2024-03-01T12:20:30+02:00"] {
            let json = format!(r#"{{"created": "{created}", "rootfs": {{"type": "layers"}}}}"#);
            let config = LegacyImageConfig::from_json(json.as_bytes()).unwrap();
            assert_eq!(config.created.as_deref(), Some(created));
        }

        let config =
            LegacyImageConfig::from_json(br#"{"created": null, "rootfs": {"type": "layers"}}"#)
                .unwrap();
        assert!(config.created.is_none());
    }

    #[test]
    fn test_str_slice_accepts_string() {
        let cc: ContainerConfig = serde_json::from_str(r#"{"Cmd": "echo hi"}"#).unwrap();
        assert_eq!(cc.cmd, Some(StrSlice(vec!["echo hi".to_string()])));
    }

    #[test]
    fn test_str_slice_accepts_array() {
        let cc: ContainerConfig =
            serde_json::from_str(r#"{"Entrypoint": ["/entry.sh", "--flag"]}"#).unwrap();
        assert_eq!(
            cc.entrypoint,
            Some(StrSlice(vec!["/entry.sh".to_string(), "--flag".to_string()]))
        );
    }

    #[test]
    fn test_str_slice_absent_or_null() {
        let cc: ContainerConfig = serde_json::from_str(r#"{"Cmd": null}"#).unwrap();
        assert!(cc.cmd.is_none());
        assert!(cc.entrypoint.is_none());
    }

    #[test]
    fn test_str_slice_rejects_other_shapes() {
        assert!(serde_json::from_str::<ContainerConfig>(r#"{"Cmd": 42}"#).is_err());
        assert!(serde_json::from_str::<ContainerConfig>(r#"{"Cmd": [1, 2]}"#).is_err());
    }

    #[test]
    fn test_rootfs_without_diff_ids() {
        let config =
            LegacyImageConfig::from_json(br#"{"rootfs": {"type": "layers", "diff_ids": null}}"#)
                .unwrap();
        assert!(config.rootfs().unwrap().diff_ids().is_empty());
    }
}
