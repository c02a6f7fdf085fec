//! Provisioning context and on-disk layout.
//!
//! The setup store drives everything; this module names the well-known keys,
//! registers their documented defaults, and freezes the handful of values the
//! rest of the run needs into an immutable [`SetupContext`] built once at
//! startup. There are no ambient singletons: the context is passed by
//! reference to every component.

use crate::error::{StevedoreError, StevedoreResult};
use crate::resolver::KeyResolver;
use crate::store::Value;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Well-known hierarchical keys in the setup store.
pub mod keys {
    pub const SETUP_TYPE: &str = "CONFIG>SETUP_TYPE";
    pub const CLUSTER_ID: &str = "CONFIG>CLUSTER_ID";
    pub const NODE_ID: &str = "CONFIG>NODE_ID";
    pub const BASE_CONFIG_PATH: &str = "CONFIG>BASE_CONFIG_PATH";
    pub const BASE_LOG_PATH: &str = "CONFIG>BASE_LOG_PATH";
    pub const INSTALL_PATH: &str = "CONFIG>INSTALL_PATH";
    pub const INSTANCE_COUNT: &str = "CONFIG>INSTANCE_COUNT";
    pub const POLL_DELAY_MS: &str = "CONFIG>COORDINATION_POLL_DELAY_MS";

    pub const INTERNAL_ENDPOINTS: &str = "CONFIG>INTERNAL_ENDPOINTS";
    pub const DIRECTORY_ENDPOINTS: &str = "CONFIG>DIRECTORY_ENDPOINTS";
    pub const DIRECTORY_SERVERS: &str = "CONFIG>DIRECTORY_SERVERS";
    pub const DIRECTORY_ADMIN_USER: &str = "CONFIG>DIRECTORY_ADMIN_USER";
    pub const DIRECTORY_ADMIN_PASSWD: &str = "CONFIG>DIRECTORY_ADMIN_PASSWD";
    pub const DIRECTORY_ROOT_SUFFIX: &str = "CONFIG>DIRECTORY_ROOT_SUFFIX";

    pub const AUTH_HTTP_PORT: &str = "CONFIG>AUTH_HTTP_PORT";
    pub const AUTH_HTTPS_PORT: &str = "CONFIG>AUTH_HTTPS_PORT";
    pub const AUTH_DEFAULT_ENDPOINT: &str = "CONFIG>AUTH_DEFAULT_ENDPOINT";

    pub const UNITS_PER_REQUEST: &str = "CONFIG>IO_MAX_UNITS_PER_REQUEST";
    pub const AUDIT_LOG_POLICY: &str = "CONFIG>AUDIT_LOG_POLICY";

    pub const BGDELETE_SCHEDULE_INTERVAL: &str = "CONFIG>BGDELETE_SCHEDULE_INTERVAL";
    pub const BGDELETE_MAX_KEYS: &str = "CONFIG>BGDELETE_MAX_KEYS";
    pub const BGDELETE_CONSUMERS: &str = "CONFIG>BGDELETE_CONSUMERS";
    pub const MSGBUS_ADMIN_ID: &str = "CONFIG>MSGBUS_ADMIN_ID";
    pub const MSGBUS_TOPIC: &str = "CONFIG>MSGBUS_TOPIC";

    /// Shared-KV key guarding the one-time directory schema push.
    pub const SCHEMA_LOCK: &str = "component>stevedore>dirsvc_schema_lock";
}

/// Documented defaults for keys the setup store may leave out.
///
/// Keys absent from this registry are required; resolving them without a
/// stored value is a `MissingKey` failure.
pub fn default_registry() -> BTreeMap<String, Value> {
    let mut defaults = BTreeMap::new();
    defaults.insert(keys::SETUP_TYPE.into(), Value::Str("standard".into()));
    defaults.insert(keys::BASE_CONFIG_PATH.into(), Value::Str("/etc/ostor".into()));
    defaults.insert(keys::BASE_LOG_PATH.into(), Value::Str("/var/log/ostor".into()));
    defaults.insert(keys::INSTALL_PATH.into(), Value::Str("/opt/ostor".into()));
    defaults.insert(keys::INSTANCE_COUNT.into(), Value::Int(1));
    defaults.insert(keys::POLL_DELAY_MS.into(), Value::Int(3_000));
    defaults.insert(keys::MSGBUS_ADMIN_ID.into(), Value::Str("ostor-admin".into()));
    defaults.insert(keys::MSGBUS_TOPIC.into(), Value::Str("bgdelete".into()));
    defaults.insert(keys::AUDIT_LOG_POLICY.into(), Value::Str("disabled".into()));
    defaults.insert(
        keys::DIRECTORY_ROOT_SUFFIX.into(),
        Value::Str("dc=ostor,dc=local".into()),
    );
    defaults
}

/// Deployment flavour; the container flavour shifts service bind ports down
/// by one because the pod-local proxy claims the advertised port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFlavor {
    Standard,
    Container,
}

impl SetupFlavor {
    pub fn parse(raw: &str) -> StevedoreResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(SetupFlavor::Standard),
            "container" | "k8" => Ok(SetupFlavor::Container),
            other => Err(StevedoreError::InvalidConfig(format!(
                "unknown setup type '{other}' (expected 'standard' or 'container')"
            ))),
        }
    }
}

/// Immutable per-run facts resolved once from the setup store.
#[derive(Debug, Clone)]
pub struct SetupContext {
    pub flavor: SetupFlavor,
    pub cluster_id: String,
    pub node_id: String,
    pub base_config_dir: PathBuf,
    pub base_log_dir: PathBuf,
    pub install_dir: PathBuf,
    pub poll_delay: Duration,
}

impl SetupContext {
    /// Build the context; `CLUSTER_ID` and `NODE_ID` have no defaults and
    /// must be present in the store.
    pub fn from_resolver(resolver: &KeyResolver<'_>) -> StevedoreResult<Self> {
        let flavor = SetupFlavor::parse(&resolver.resolve_str(keys::SETUP_TYPE)?)?;
        let cluster_id = resolver.resolve_str(keys::CLUSTER_ID)?;
        let node_id = resolver.resolve_str(keys::NODE_ID)?;
        let base_config_dir = PathBuf::from(resolver.resolve_str(keys::BASE_CONFIG_PATH)?);
        let base_log_dir = PathBuf::from(resolver.resolve_str(keys::BASE_LOG_PATH)?);
        let install_dir = PathBuf::from(resolver.resolve_str(keys::INSTALL_PATH)?);
        let poll_delay = Duration::from_millis(resolver.resolve_u64(keys::POLL_DELAY_MS)?);
        if cluster_id.trim().is_empty() {
            return Err(StevedoreError::InvalidConfig(
                "CONFIG>CLUSTER_ID must not be empty".into(),
            ));
        }
        if node_id.trim().is_empty() {
            return Err(StevedoreError::InvalidConfig(
                "CONFIG>NODE_ID must not be empty".into(),
            ));
        }
        Ok(Self {
            flavor,
            cluster_id,
            node_id,
            base_config_dir,
            base_log_dir,
            install_dir,
            poll_delay,
        })
    }
}

/// Relative locations of the config files and scripts this tool touches.
///
/// Paths under `base_config_dir` are the mutation targets; paths under the
/// install dir are the packaged scripts we shell out to. Overridable from a
/// small TOML/YAML file for non-standard packaging.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Layout {
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,

    #[serde(default = "default_cluster_config")]
    pub cluster_config: String,

    #[serde(default = "default_object_config")]
    pub object_config: String,

    #[serde(default = "default_auth_config")]
    pub auth_config: String,

    #[serde(default = "default_keystore_config")]
    pub keystore_config: String,

    #[serde(default = "default_bgdelete_config")]
    pub bgdelete_config: String,

    #[serde(default = "default_sysconfig_dir")]
    pub sysconfig_dir: String,

    #[serde(default = "default_schema_script")]
    pub schema_script: String,

    #[serde(default = "default_keystore_script")]
    pub keystore_script: String,

    #[serde(default = "default_proxy_script")]
    pub proxy_script: String,
}

fn default_lock_dir() -> String {
    "setup".into()
}

fn default_cluster_config() -> String {
    "cluster/cluster.yaml".into()
}

fn default_object_config() -> String {
    "ostor/conf/ostor.yaml".into()
}

fn default_auth_config() -> String {
    "auth/resources/authserver.properties".into()
}

fn default_keystore_config() -> String {
    "auth/resources/keystore.properties".into()
}

fn default_bgdelete_config() -> String {
    "bgdelete/config.yaml".into()
}

fn default_sysconfig_dir() -> String {
    "ostor/sysconfig".into()
}

fn default_schema_script() -> String {
    "install/dirsvc/setup_schema.sh".into()
}

fn default_keystore_script() -> String {
    "auth/scripts/create_keystore_password.sh".into()
}

fn default_proxy_script() -> String {
    "proxy/setup_proxy.sh".into()
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            cluster_config: default_cluster_config(),
            object_config: default_object_config(),
            auth_config: default_auth_config(),
            keystore_config: default_keystore_config(),
            bgdelete_config: default_bgdelete_config(),
            sysconfig_dir: default_sysconfig_dir(),
            schema_script: default_schema_script(),
            keystore_script: default_keystore_script(),
            proxy_script: default_proxy_script(),
        }
    }
}

impl Layout {
    /// Load a layout override (TOML by extension, YAML otherwise), or the
    /// defaults when `path` is `None`.
    pub fn load_or_default(path: Option<&Path>) -> StevedoreResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        if is_toml {
            toml::from_str(&contents)
                .map_err(|err| StevedoreError::InvalidConfig(err.to_string()))
        } else {
            serde_yaml::from_str(&contents)
                .map_err(|err| StevedoreError::InvalidConfig(err.to_string()))
        }
    }

    pub fn lock_dir(&self, ctx: &SetupContext) -> PathBuf {
        ctx.base_config_dir.join(&self.lock_dir)
    }

    pub fn cluster_config(&self, ctx: &SetupContext) -> PathBuf {
        ctx.base_config_dir.join(&self.cluster_config)
    }

    pub fn object_config(&self, ctx: &SetupContext) -> PathBuf {
        ctx.base_config_dir.join(&self.object_config)
    }

    pub fn auth_config(&self, ctx: &SetupContext) -> PathBuf {
        ctx.base_config_dir.join(&self.auth_config)
    }

    pub fn keystore_config(&self, ctx: &SetupContext) -> PathBuf {
        ctx.base_config_dir.join(&self.keystore_config)
    }

    pub fn bgdelete_config(&self, ctx: &SetupContext) -> PathBuf {
        ctx.base_config_dir.join(&self.bgdelete_config)
    }

    /// Per-node directory holding the generated FID sysconfig files.
    pub fn sysconfig_dir(&self, ctx: &SetupContext) -> PathBuf {
        ctx.base_config_dir.join(&self.sysconfig_dir).join(&ctx.node_id)
    }

    pub fn schema_script(&self, ctx: &SetupContext) -> PathBuf {
        ctx.install_dir.join(&self.schema_script)
    }

    pub fn keystore_script(&self, ctx: &SetupContext) -> PathBuf {
        ctx.install_dir.join(&self.keystore_script)
    }

    pub fn proxy_script(&self, ctx: &SetupContext) -> PathBuf {
        ctx.install_dir.join(&self.proxy_script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConfStore, Value};
    use tempfile::tempdir;

    struct MapStore(BTreeMap<String, Value>);

    impl ConfStore for MapStore {
        fn get(&self, key: &str) -> Option<Value> {
            self.0.get(key).cloned()
        }

        fn set(&mut self, key: &str, value: Value, _persist: bool) -> StevedoreResult<()> {
            self.0.insert(key.to_string(), value);
            Ok(())
        }

        fn persist(&self) -> StevedoreResult<()> {
            Ok(())
        }
    }

    fn minimal_store() -> MapStore {
        let mut entries = BTreeMap::new();
        entries.insert(keys::CLUSTER_ID.to_string(), Value::Str("cluster-7".into()));
        entries.insert(keys::NODE_ID.to_string(), Value::Str("node-a".into()));
        MapStore(entries)
    }

    #[test]
    fn context_applies_documented_defaults() {
        let store = minimal_store();
        let resolver = KeyResolver::with_defaults(&store, default_registry());
        let ctx = SetupContext::from_resolver(&resolver).unwrap();

        assert_eq!(ctx.flavor, SetupFlavor::Standard);
        assert_eq!(ctx.cluster_id, "cluster-7");
        assert_eq!(ctx.node_id, "node-a");
        assert_eq!(ctx.base_config_dir, PathBuf::from("/etc/ostor"));
        assert_eq!(ctx.poll_delay, Duration::from_millis(3_000));
    }

    #[test]
    fn context_requires_cluster_and_node_ids() {
        let store = MapStore(BTreeMap::new());
        let resolver = KeyResolver::with_defaults(&store, default_registry());
        assert!(matches!(
            SetupContext::from_resolver(&resolver),
            Err(StevedoreError::MissingKey(_))
        ));
    }

    #[test]
    fn container_flavor_accepts_legacy_spelling() {
        assert_eq!(SetupFlavor::parse("K8").unwrap(), SetupFlavor::Container);
        assert_eq!(
            SetupFlavor::parse("container").unwrap(),
            SetupFlavor::Container
        );
        assert!(SetupFlavor::parse("cloud").is_err());
    }

    #[test]
    fn layout_loads_toml_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layout.toml");
        std::fs::write(&path, "object_config = \"custom/object.yaml\"\n").unwrap();

        let layout = Layout::load_or_default(Some(&path)).unwrap();
        assert_eq!(layout.object_config, "custom/object.yaml");
        // Untouched fields keep their defaults.
        assert_eq!(layout.auth_config, default_auth_config());
    }

    #[test]
    fn layout_paths_are_rebased_on_context_dirs() {
        let store = minimal_store();
        let resolver = KeyResolver::with_defaults(&store, default_registry());
        let ctx = SetupContext::from_resolver(&resolver).unwrap();
        let layout = Layout::default();

        assert_eq!(
            layout.object_config(&ctx),
            PathBuf::from("/etc/ostor/ostor/conf/ostor.yaml")
        );
        assert_eq!(
            layout.sysconfig_dir(&ctx),
            PathBuf::from("/etc/ostor/ostor/sysconfig/node-a")
        );
        assert_eq!(
            layout.schema_script(&ctx),
            PathBuf::from("/opt/ostor/install/dirsvc/setup_schema.sh")
        );
    }
}
