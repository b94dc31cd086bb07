//! Read-modify-write access to control-plane settings.
//!
//! A setting's `value` is a JSON object of string keys to string values.
//! [`ConfigMutator::update`] rewrites exactly one key and leaves the rest as
//! it found them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// API group of the control plane's settings resource
pub const SETTING_GROUP: &str = "management.cattle.io";
/// API version of the settings resource
pub const SETTING_VERSION: &str = "v3";
/// Kind of the settings resource
pub const SETTING_KIND: &str = "Setting";

/// A setting as stored by the control plane
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawSetting {
    /// Setting name
    pub name: String,
    /// Explicitly configured value; empty means "use the default"
    pub value: String,
    /// Built-in default value
    pub default: String,
    /// Resource version observed on read
    pub resource_version: Option<String>,
}

/// Decoded setting: its key/value map plus the version it was read at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Setting {
    /// Setting name
    pub name: String,
    /// Resource version observed on read
    pub resource_version: Option<String>,
    /// Decoded key/value entries
    pub entries: BTreeMap<String, String>,
}

impl Setting {
    /// Value of a single key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

/// Settings storage abstraction
///
/// Implemented by [`KubeSettingsApi`] in production and mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SettingsApi: Send + Sync {
    /// Fetch a setting by name
    async fn get(&self, name: &str) -> Result<RawSetting, Error>;

    /// Write a setting's `value`, guarded by its resource version if present
    async fn replace(&self, setting: &RawSetting) -> Result<(), Error>;
}

/// Settings stored as cluster-scoped `management.cattle.io/v3` resources
pub struct KubeSettingsApi {
    client: Client,
    resource: ApiResource,
}

impl KubeSettingsApi {
    /// Create a settings API backed by the given client
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk(SETTING_GROUP, SETTING_VERSION, SETTING_KIND);
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
        }
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.resource)
    }
}

fn string_field(obj: &DynamicObject, field: &str) -> String {
    obj.data
        .get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl SettingsApi for KubeSettingsApi {
    async fn get(&self, name: &str) -> Result<RawSetting, Error> {
        let obj = self
            .api()
            .get(name)
            .await
            .map_err(|e| Error::from_kube("setting", name, e))?;

        Ok(RawSetting {
            name: name.to_string(),
            value: string_field(&obj, "value"),
            default: string_field(&obj, "default"),
            resource_version: obj.metadata.resource_version.clone(),
        })
    }

    async fn replace(&self, setting: &RawSetting) -> Result<(), Error> {
        let mut patch = serde_json::json!({ "value": setting.value });
        if let Some(rv) = &setting.resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        self.api()
            .patch(
                &setting.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Error::from_kube("setting", &setting.name, e))?;

        Ok(())
    }
}

/// Reads settings and rewrites single keys inside them
#[derive(Clone)]
pub struct ConfigMutator {
    api: Arc<dyn SettingsApi>,
}

impl ConfigMutator {
    /// Create a mutator over the given settings storage
    pub fn new(api: Arc<dyn SettingsApi>) -> Self {
        Self { api }
    }

    /// Read and decode a setting.
    ///
    /// An empty `value` falls back to the setting's `default`; both empty
    /// decodes to an empty map.
    pub async fn read(&self, name: &str) -> Result<Setting, Error> {
        let raw = self.api.get(name).await?;
        Ok(Setting {
            name: raw.name.clone(),
            resource_version: raw.resource_version.clone(),
            entries: decode_entries(&raw)?,
        })
    }

    /// Set `key` to `value` inside the named setting, keeping every other key.
    ///
    /// Returns the key's previous value.
    pub async fn update(&self, name: &str, key: &str, value: &str) -> Result<Option<String>, Error> {
        self.rewrite(name, key, Some(value)).await
    }

    /// Drop `key` from the named setting, keeping every other key.
    ///
    /// Returns the key's previous value; nothing is written if it was absent.
    pub async fn remove(&self, name: &str, key: &str) -> Result<Option<String>, Error> {
        self.rewrite(name, key, None).await
    }

    async fn rewrite(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, Error> {
        let raw = self.api.get(name).await?;
        let mut entries = decode_entries(&raw)?;
        let previous = match value {
            Some(value) => entries.insert(key.to_string(), value.to_string()),
            None => match entries.remove(key) {
                Some(previous) => Some(previous),
                None => return Ok(None),
            },
        };

        let encoded = serde_json::to_string(&entries).map_err(|e| Error::Encode {
            resource: format!("setting {name}"),
            message: e.to_string(),
        })?;

        debug!(setting = %name, key = %key, "Writing setting");
        self.api
            .replace(&RawSetting {
                value: encoded,
                ..raw
            })
            .await?;

        info!(
            setting = %name,
            key = %key,
            previous = previous.as_deref().unwrap_or(""),
            value = value.unwrap_or("<removed>"),
            "Updated setting"
        );
        Ok(previous)
    }
}

fn decode_entries(raw: &RawSetting) -> Result<BTreeMap<String, String>, Error> {
    let source = if raw.value.trim().is_empty() {
        &raw.default
    } else {
        &raw.value
    };
    if source.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(source).map_err(|e| Error::Decode {
        resource: format!("setting {}", raw.name),
        message: e.to_string(),
    })
}
