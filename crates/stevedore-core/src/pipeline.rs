//! Read-transform-write propagation of setup values into service configs.
//!
//! Each [`TransformMapping`] is one durable commit: the target store is
//! persisted before the next mapping runs, so a crash mid-sequence leaves a
//! well-defined prefix of completed writes and a re-run simply applies the
//! remainder. Re-applying a mapping with the same resolved source value is
//! idempotent (plain set, no accumulation).
//!
//! Transforms are a closed, named set rather than passed-in callables so each
//! one is independently unit-testable. Every transform validates its own
//! domain and fails loudly instead of clamping.

use crate::config::{SetupContext, SetupFlavor};
use crate::endpoint::{decode_endpoints, select_by_scheme, Endpoint};
use crate::error::{StevedoreError, StevedoreResult};
use crate::resolver::KeyResolver;
use crate::store::{open_store_at, StoreFormat, Value};
use log::info;
use std::path::PathBuf;

/// One element of a [`Transform::JoinPath`] template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Literal(String),
    /// Substituted with the provisioning node's id.
    NodeId,
}

/// Named transform strategies applied between resolve and write-back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Power-of-two tuning parameter in [2, 128].
    UnitsPerRequest,
    /// Hostname of the first endpoint with the given scheme.
    EndpointFqdn { scheme: String },
    /// Port of the first endpoint with the given scheme; a missing port is
    /// fatal, never defaulted.
    EndpointPort { scheme: String },
    /// `scheme://fqdn:port` of the first endpoint with the given scheme.
    EndpointUrl { scheme: String },
    /// Like `EndpointPort`, shifted down by one on container setups where
    /// the pod-local proxy claims the advertised port.
    BindPort { scheme: String },
    /// Like `EndpointUrl`, with the same container port shift, so dialers
    /// reach the port a `BindPort`-configured service actually listens on.
    BindUrl { scheme: String },
    /// Join the resolved base path with literal segments and/or the node id.
    JoinPath { segments: Vec<PathSegment> },
    /// Wrap the resolved account name as `cn=<value>,<suffix>`.
    LoginDn { suffix: String },
}

impl Transform {
    pub fn apply(&self, value: &Value, ctx: &SetupContext) -> StevedoreResult<Value> {
        match self {
            Transform::UnitsPerRequest => units_per_request(value),
            Transform::EndpointFqdn { scheme } => {
                let endpoints = decode_endpoints(value)?;
                let endpoint = required_endpoint(&endpoints, scheme)?;
                Ok(Value::Str(endpoint.fqdn.clone()))
            }
            Transform::EndpointPort { scheme } => {
                let endpoints = decode_endpoints(value)?;
                let endpoint = required_endpoint(&endpoints, scheme)?;
                Ok(Value::Int(i64::from(required_port(endpoint, scheme)?)))
            }
            Transform::EndpointUrl { scheme } => {
                let endpoints = decode_endpoints(value)?;
                let endpoint = required_endpoint(&endpoints, scheme)?;
                Ok(Value::Str(endpoint.url()?))
            }
            Transform::BindPort { scheme } => {
                let endpoints = decode_endpoints(value)?;
                let endpoint = required_endpoint(&endpoints, scheme)?;
                Ok(Value::Int(bound_port(endpoint, scheme, ctx.flavor)?))
            }
            Transform::BindUrl { scheme } => {
                let endpoints = decode_endpoints(value)?;
                let endpoint = required_endpoint(&endpoints, scheme)?;
                let port = bound_port(endpoint, scheme, ctx.flavor)?;
                Ok(Value::Str(format!(
                    "{}://{}:{}",
                    endpoint.scheme, endpoint.fqdn, port
                )))
            }
            Transform::JoinPath { segments } => {
                let base = value.as_str().ok_or_else(|| {
                    StevedoreError::Transform(format!(
                        "path join expects a string base path, got: {value}"
                    ))
                })?;
                let mut path = PathBuf::from(base);
                for segment in segments {
                    match segment {
                        PathSegment::Literal(part) => path.push(part),
                        PathSegment::NodeId => path.push(&ctx.node_id),
                    }
                }
                Ok(Value::Str(path.to_string_lossy().into_owned()))
            }
            Transform::LoginDn { suffix } => {
                let user = value.as_str().ok_or_else(|| {
                    StevedoreError::Transform(format!(
                        "login DN expects a string account name, got: {value}"
                    ))
                })?;
                Ok(Value::Str(format!("cn={user},{suffix}")))
            }
        }
    }
}

fn units_per_request(value: &Value) -> StevedoreResult<Value> {
    let units = value.as_i64().ok_or_else(|| {
        StevedoreError::Transform(format!(
            "units-per-request value '{value}' is not an integer"
        ))
    })?;
    if !(2..=128).contains(&units) {
        return Err(StevedoreError::Transform(format!(
            "units-per-request must be between 2 and 128, got {units}"
        )));
    }
    if units.count_ones() != 1 {
        return Err(StevedoreError::Transform(format!(
            "units-per-request must be a power of two, got {units}"
        )));
    }
    Ok(Value::Int(units))
}

fn required_endpoint<'a>(
    endpoints: &'a [Endpoint],
    scheme: &str,
) -> StevedoreResult<&'a Endpoint> {
    select_by_scheme(endpoints, scheme).ok_or_else(|| {
        StevedoreError::Transform(format!("no endpoint with scheme '{scheme}' is specified"))
    })
}

fn bound_port(endpoint: &Endpoint, scheme: &str, flavor: SetupFlavor) -> StevedoreResult<i64> {
    let port = i64::from(required_port(endpoint, scheme)?);
    Ok(match flavor {
        SetupFlavor::Container => port - 1,
        SetupFlavor::Standard => port,
    })
}

fn required_port(endpoint: &Endpoint, scheme: &str) -> StevedoreResult<u16> {
    endpoint.port.ok_or_else(|| {
        StevedoreError::Transform(format!(
            "endpoint for scheme '{scheme}' does not specify a port"
        ))
    })
}

/// One "read key A, optionally transform, write key B" operation.
#[derive(Debug, Clone)]
pub struct TransformMapping {
    pub source_key: String,
    pub target_file: PathBuf,
    pub target_format: StoreFormat,
    pub target_key: String,
    pub transform: Option<Transform>,
}

impl TransformMapping {
    pub fn new(
        source_key: &str,
        target_file: PathBuf,
        target_format: StoreFormat,
        target_key: &str,
    ) -> Self {
        Self {
            source_key: source_key.to_string(),
            target_file,
            target_format,
            target_key: target_key.to_string(),
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// Apply one mapping: verify the target file pre-exists, resolve the source
/// (which may live in a different store than the target), transform, and
/// write back with an immediate persist.
pub fn apply_mapping(
    resolver: &KeyResolver<'_>,
    ctx: &SetupContext,
    mapping: &TransformMapping,
) -> StevedoreResult<()> {
    if !mapping.target_file.is_file() {
        return Err(StevedoreError::ConfigFileMissing(
            mapping.target_file.clone(),
        ));
    }

    let resolved = resolver.resolve(&mapping.source_key)?;
    let value = match &mapping.transform {
        Some(transform) => transform.apply(&resolved, ctx)?,
        None => resolved,
    };

    let mut target = open_store_at(mapping.target_format, &mapping.target_file)?;
    target.set(&mapping.target_key, value.clone(), true)?;
    info!(
        "updated {} <- {} in {}",
        mapping.target_key,
        value,
        mapping.target_file.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_registry, keys};
    use crate::store::{ConfStore, YamlStore};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
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

    fn sample_context(flavor: SetupFlavor) -> SetupContext {
        SetupContext {
            flavor,
            cluster_id: "cluster-7".into(),
            node_id: "node-a".into(),
            base_config_dir: "/etc/ostor".into(),
            base_log_dir: "/var/log/ostor".into(),
            install_dir: "/opt/ostor".into(),
            poll_delay: Duration::from_millis(1),
        }
    }

    fn setup_store(entries: &[(&str, Value)]) -> MapStore {
        MapStore(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn units_per_request_accepts_powers_of_two_in_range() {
        let ctx = sample_context(SetupFlavor::Standard);
        for accepted in [2, 4, 8, 16, 32, 64, 128] {
            let result = Transform::UnitsPerRequest
                .apply(&Value::Int(accepted), &ctx)
                .unwrap();
            assert_eq!(result, Value::Int(accepted));
        }
    }

    #[test]
    fn units_per_request_rejects_out_of_domain_values() {
        let ctx = sample_context(SetupFlavor::Standard);
        for rejected in [0, 1, 3, 129, 130, 256] {
            let err = Transform::UnitsPerRequest
                .apply(&Value::Int(rejected), &ctx)
                .unwrap_err();
            assert!(
                matches!(err, StevedoreError::Transform(_)),
                "value {rejected} should be rejected with a domain error"
            );
        }
    }

    #[test]
    fn units_per_request_accepts_digit_strings() {
        let ctx = sample_context(SetupFlavor::Standard);
        let result = Transform::UnitsPerRequest
            .apply(&Value::Str("32".into()), &ctx)
            .unwrap();
        assert_eq!(result, Value::Int(32));
    }

    #[test]
    fn bind_port_shifts_down_on_container_flavor() {
        let endpoints =
            Value::Str("[{'scheme': 'http', 'fqdn': 'svc.local', 'port': 28049}]".into());
        let transform = Transform::BindPort {
            scheme: "http".into(),
        };

        let standard = transform
            .apply(&endpoints, &sample_context(SetupFlavor::Standard))
            .unwrap();
        assert_eq!(standard, Value::Int(28049));

        let container = transform
            .apply(&endpoints, &sample_context(SetupFlavor::Container))
            .unwrap();
        assert_eq!(container, Value::Int(28048));
    }

    #[test]
    fn bind_url_dials_the_shifted_port_on_container_flavor() {
        let endpoints =
            Value::Str("[{'scheme': 'http', 'fqdn': 'svc.local', 'port': 28049}]".into());
        let transform = Transform::BindUrl {
            scheme: "http".into(),
        };

        let standard = transform
            .apply(&endpoints, &sample_context(SetupFlavor::Standard))
            .unwrap();
        assert_eq!(standard, Value::Str("http://svc.local:28049".into()));

        let container = transform
            .apply(&endpoints, &sample_context(SetupFlavor::Container))
            .unwrap();
        assert_eq!(container, Value::Str("http://svc.local:28048".into()));
    }

    #[test]
    fn endpoint_transforms_fail_on_missing_scheme_or_port() {
        let ctx = sample_context(SetupFlavor::Standard);
        let endpoints = Value::Str("[{'scheme': 'http', 'fqdn': 'svc.local'}]".into());

        let missing_scheme = Transform::EndpointFqdn {
            scheme: "ldap".into(),
        }
        .apply(&endpoints, &ctx)
        .unwrap_err();
        assert!(matches!(missing_scheme, StevedoreError::Transform(_)));

        let missing_port = Transform::EndpointPort {
            scheme: "http".into(),
        }
        .apply(&endpoints, &ctx)
        .unwrap_err();
        assert!(matches!(missing_port, StevedoreError::Transform(_)));
    }

    #[test]
    fn join_path_appends_node_id() {
        let ctx = sample_context(SetupFlavor::Standard);
        let transform = Transform::JoinPath {
            segments: vec![
                PathSegment::Literal("ostor".into()),
                PathSegment::NodeId,
            ],
        };
        let result = transform
            .apply(&Value::Str("/var/log/ostor".into()), &ctx)
            .unwrap();
        assert_eq!(result, Value::Str("/var/log/ostor/ostor/node-a".into()));
    }

    #[test]
    fn login_dn_wraps_account_name() {
        let ctx = sample_context(SetupFlavor::Standard);
        let transform = Transform::LoginDn {
            suffix: "dc=ostor,dc=local".into(),
        };
        let result = transform
            .apply(&Value::Str("sgiamadmin".into()), &ctx)
            .unwrap();
        assert_eq!(result, Value::Str("cn=sgiamadmin,dc=ostor,dc=local".into()));
    }

    #[test]
    fn apply_mapping_requires_target_file() {
        let dir = tempdir().unwrap();
        let store = setup_store(&[("CONFIG>CLUSTER_ID", Value::Str("c".into()))]);
        let resolver = KeyResolver::with_defaults(&store, default_registry());
        let ctx = sample_context(SetupFlavor::Standard);

        let mapping = TransformMapping::new(
            keys::CLUSTER_ID,
            dir.path().join("absent.yaml"),
            StoreFormat::Yaml,
            "cluster>id",
        );
        assert!(matches!(
            apply_mapping(&resolver, &ctx, &mapping),
            Err(StevedoreError::ConfigFileMissing(_))
        ));
    }

    #[test]
    fn apply_mapping_is_idempotent_across_reruns() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("cluster.yaml");
        fs::write(&target, "cluster:\n  name: seed\n").unwrap();

        let store = setup_store(&[(keys::CLUSTER_ID, Value::Str("cluster-7".into()))]);
        let resolver = KeyResolver::with_defaults(&store, default_registry());
        let ctx = sample_context(SetupFlavor::Standard);
        let mapping = TransformMapping::new(
            keys::CLUSTER_ID,
            target.clone(),
            StoreFormat::Yaml,
            "cluster>id",
        );

        apply_mapping(&resolver, &ctx, &mapping).unwrap();
        let first = fs::read_to_string(&target).unwrap();
        apply_mapping(&resolver, &ctx, &mapping).unwrap();
        let second = fs::read_to_string(&target).unwrap();

        assert_eq!(first, second, "re-running a mapping must not drift");
        let reread = YamlStore::load(Path::new(&target)).unwrap();
        assert_eq!(
            reread.get("cluster>id"),
            Some(Value::Str("cluster-7".into()))
        );
        // Pre-existing content survives.
        assert_eq!(reread.get("cluster>name"), Some(Value::Str("seed".into())));
    }

    #[test]
    fn apply_mapping_writes_properties_targets() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("auth.properties");
        fs::write(&target, "httpPort = 1\n").unwrap();

        let store = setup_store(&[(
            keys::DIRECTORY_ENDPOINTS,
            Value::Str("[{'scheme': 'ldap', 'fqdn': 'dir.local', 'port': 389}]".into()),
        )]);
        let resolver = KeyResolver::with_defaults(&store, default_registry());
        let ctx = sample_context(SetupFlavor::Standard);

        let mapping = TransformMapping::new(
            keys::DIRECTORY_ENDPOINTS,
            target.clone(),
            StoreFormat::Properties,
            "ldapHost",
        )
        .with_transform(Transform::EndpointFqdn {
            scheme: "ldap".into(),
        });

        apply_mapping(&resolver, &ctx, &mapping).unwrap();
        let contents = fs::read_to_string(&target).unwrap();
        assert!(contents.contains("ldapHost = dir.local"));
        assert!(contents.contains("httpPort = 1"));
    }
}
