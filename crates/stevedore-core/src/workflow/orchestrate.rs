//! Phase sequencing for one provisioning run.
//!
//! Phases run in the system-fixed dependency order; any failing phase fails
//! the whole run. There is no rollback: every change is forward-only and
//! idempotent, so re-running the whole tool is the defined recovery path.

use super::{event, ordered_services, Service, WorkflowLevel, WorkflowReport};
use crate::cluster::with_cluster_lock;
use crate::config::{keys, Layout, SetupContext};
use crate::endpoint::{decode_endpoints, select_by_scheme};
use crate::error::{StevedoreError, StevedoreResult};
use crate::nodelock::with_node_lock;
use crate::pipeline::{apply_mapping, PathSegment, Transform, TransformMapping};
use crate::process::run_checked;
use crate::provision::{ensure_account, ensure_topic, link_fid_files, DirectoryAccounts, MessageBusAdmin};
use crate::resolver::KeyResolver;
use crate::store::{KvStore, StoreFormat, Value};
use log::info;

/// Name of the background-delete service account in the directory service.
const BG_ACCOUNT_NAME: &str = "bgdelete-svc";
/// Prefix of the generated per-instance FID sysconfig files.
const FID_FILE_PREFIX: &str = "ostor-server";

/// Sequences the provisioning phases and owns failure propagation.
pub struct Orchestrator<'a> {
    ctx: &'a SetupContext,
    resolver: &'a KeyResolver<'a>,
    layout: &'a Layout,
    kv: &'a dyn KvStore,
    bus: &'a dyn MessageBusAdmin,
    accounts: &'a dyn DirectoryAccounts,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ctx: &'a SetupContext,
        resolver: &'a KeyResolver<'a>,
        layout: &'a Layout,
        kv: &'a dyn KvStore,
        bus: &'a dyn MessageBusAdmin,
        accounts: &'a dyn DirectoryAccounts,
    ) -> Self {
        Self {
            ctx,
            resolver,
            layout,
            kv,
            bus,
            accounts,
        }
    }

    /// Run the requested services under the exclusive host lock.
    pub fn run(&self, requested: &[Service]) -> StevedoreResult<WorkflowReport> {
        let lock_dir = self.layout.lock_dir(self.ctx);
        with_node_lock(&lock_dir, || self.run_locked(requested))
    }

    fn run_locked(&self, requested: &[Service]) -> StevedoreResult<WorkflowReport> {
        let services = ordered_services(requested);
        let mut events = Vec::new();

        info!("validations started");
        self.validate_keys(&services)?;
        info!("validations completed");
        events.push(event(WorkflowLevel::Info, "validations completed"));

        for service in &services {
            info!("{} config started", service.name());
            match service {
                Service::ClusterCommon => self.process_cluster_common()?,
                Service::Proxy => self.process_proxy()?,
                Service::ObjectServer => self.process_object_server(&mut events)?,
                Service::AuthServer => self.process_auth_server(&mut events)?,
                Service::BgScheduler => self.process_bg_scheduler(&mut events)?,
                Service::BgWorker => self.process_bg_worker(&mut events)?,
            }
            info!("{} config completed", service.name());
            events.push(event(
                WorkflowLevel::Success,
                format!("{} config completed", service.name()),
            ));
        }

        Ok(WorkflowReport {
            title: format!("Provisioned node {}", self.ctx.node_id),
            events,
        })
    }

    /// Fail fast when a requested service references keys the store cannot
    /// resolve, before any file is touched.
    fn validate_keys(&self, services: &[Service]) -> StevedoreResult<()> {
        for service in services {
            for key in required_keys(*service) {
                self.resolver.resolve(key)?;
            }
        }
        Ok(())
    }

    fn apply_all(&self, mappings: &[TransformMapping]) -> StevedoreResult<()> {
        for mapping in mappings {
            apply_mapping(self.resolver, self.ctx, mapping)?;
        }
        Ok(())
    }

    fn process_cluster_common(&self) -> StevedoreResult<()> {
        self.apply_all(&cluster_mappings(self.ctx, self.layout))
    }

    fn process_proxy(&self) -> StevedoreResult<()> {
        let script = self.layout.proxy_script(self.ctx);
        run_checked(&[
            script.to_string_lossy().into_owned(),
            "--config-dir".to_string(),
            self.ctx.base_config_dir.to_string_lossy().into_owned(),
        ])?;
        Ok(())
    }

    fn process_object_server(
        &self,
        events: &mut Vec<super::WorkflowEvent>,
    ) -> StevedoreResult<()> {
        self.apply_all(&object_server_mappings(self.ctx, self.layout))?;

        let instance_count = self.resolver.resolve_u64(keys::INSTANCE_COUNT)? as usize;
        let created = link_fid_files(
            &self.layout.sysconfig_dir(self.ctx),
            FID_FILE_PREFIX,
            instance_count,
        )?;
        events.push(event(
            WorkflowLevel::Info,
            format!("linked {} FID sysconfig file(s)", created.len()),
        ));
        Ok(())
    }

    fn process_auth_server(&self, events: &mut Vec<super::WorkflowEvent>) -> StevedoreResult<()> {
        let suffix = self.resolver.resolve_str(keys::DIRECTORY_ROOT_SUFFIX)?;
        self.apply_all(&auth_server_mappings(self.ctx, self.layout, &suffix))?;

        let script = self.layout.keystore_script(self.ctx);
        run_checked(&[
            "sh".to_string(),
            script.to_string_lossy().into_owned(),
            self.ctx.base_config_dir.to_string_lossy().into_owned(),
        ])?;
        events.push(event(WorkflowLevel::Info, "keystore password refreshed"));

        let pushed = with_cluster_lock(
            self.kv,
            keys::SCHEMA_LOCK,
            &self.ctx.node_id,
            self.ctx.poll_delay,
            || self.push_directory_schema(),
        )?;
        events.push(event(
            if pushed {
                WorkflowLevel::Success
            } else {
                WorkflowLevel::Warn
            },
            if pushed {
                "directory schema pushed"
            } else {
                "directory schema push skipped (coordination store unreachable)"
            },
        ));
        Ok(())
    }

    /// Push the shared directory schema to every configured directory
    /// server. Runs under the cluster lock; exactly one node acts at a time.
    fn push_directory_schema(&self) -> StevedoreResult<()> {
        let admin_user = self.resolver.resolve_str(keys::DIRECTORY_ADMIN_USER)?;
        let admin_passwd = self.resolver.resolve_str(keys::DIRECTORY_ADMIN_PASSWD)?;
        let servers = self.directory_servers()?;
        let script = self.layout.schema_script(self.ctx);
        for server in &servers {
            run_checked(&[
                script.to_string_lossy().into_owned(),
                "--hostname".to_string(),
                server.clone(),
                "--user".to_string(),
                admin_user.clone(),
                "--passwd".to_string(),
                admin_passwd.clone(),
            ])?;
        }
        info!("directory schema pushed to {} server(s)", servers.len());
        Ok(())
    }

    fn directory_servers(&self) -> StevedoreResult<Vec<String>> {
        decode_string_list(&self.resolver.resolve(keys::DIRECTORY_SERVERS)?)
    }

    fn process_bg_scheduler(&self, events: &mut Vec<super::WorkflowEvent>) -> StevedoreResult<()> {
        self.apply_all(&bg_scheduler_mappings(self.ctx, self.layout))?;
        self.provision_bg_topic(events)
    }

    fn process_bg_worker(&self, events: &mut Vec<super::WorkflowEvent>) -> StevedoreResult<()> {
        // The scheduler config is re-applied here too: the worker floats
        // between nodes and must see a current scheduler section everywhere.
        self.apply_all(&bg_scheduler_mappings(self.ctx, self.layout))?;
        self.apply_all(&bg_worker_mappings(self.ctx, self.layout))?;
        self.provision_bg_topic(events)?;

        let endpoints = decode_endpoints(&self.resolver.resolve(keys::DIRECTORY_ENDPOINTS)?)?;
        let ldap = select_by_scheme(&endpoints, "ldap").ok_or_else(|| {
            StevedoreError::InvalidConfig(
                "no directory endpoint with scheme 'ldap' is specified".into(),
            )
        })?;
        let endpoint_url = format!("ldap://{}", ldap.fqdn);

        let admin_user = self.resolver.resolve_str(keys::DIRECTORY_ADMIN_USER)?;
        let admin_passwd = self.resolver.resolve_str(keys::DIRECTORY_ADMIN_PASSWD)?;
        let params = bg_account_params(self.ctx);
        ensure_account(
            self.accounts,
            &admin_user,
            &admin_passwd,
            &params,
            &endpoint_url,
        )?;
        events.push(event(
            WorkflowLevel::Info,
            format!("background-delete account ensured via {endpoint_url}"),
        ));
        Ok(())
    }

    fn provision_bg_topic(&self, events: &mut Vec<super::WorkflowEvent>) -> StevedoreResult<()> {
        let admin_id = self.resolver.resolve_str(keys::MSGBUS_ADMIN_ID)?;
        let topic = self.resolver.resolve_str(keys::MSGBUS_TOPIC)?;
        let partitions = self.partition_count()?;
        ensure_topic(self.bus, &admin_id, &topic, partitions)?;
        events.push(event(
            WorkflowLevel::Info,
            format!("topic '{topic}' ensured with {partitions} partition(s)"),
        ));
        Ok(())
    }

    /// Partition count is twice the number of nodes that consume the
    /// background-delete topic.
    fn partition_count(&self) -> StevedoreResult<u32> {
        let consumers = decode_string_list(&self.resolver.resolve(keys::BGDELETE_CONSUMERS)?)?;
        if consumers.is_empty() {
            return Err(StevedoreError::InvalidConfig(
                "no nodes advertise the background-delete service".into(),
            ));
        }
        let partitions = (consumers.len() * 2) as u32;
        info!(
            "{} background-delete consumer(s), {} partition(s)",
            consumers.len(),
            partitions
        );
        Ok(partitions)
    }
}

/// Decode a list of strings stored either structured or as a string literal.
/// Like endpoint decoding, re-decoding a decoded list is a no-op.
fn decode_string_list(value: &Value) -> StevedoreResult<Vec<String>> {
    match value {
        Value::Str(raw) => serde_yaml::from_str(raw).map_err(|err| {
            StevedoreError::Store(format!("failed to decode list '{raw}': {err}"))
        }),
        Value::List(items) => Ok(items.iter().map(|item| item.to_string()).collect()),
        other => Err(StevedoreError::Store(format!(
            "expected a list, got: {other}"
        ))),
    }
}

fn required_keys(service: Service) -> &'static [&'static str] {
    match service {
        Service::ClusterCommon => &[
            keys::CLUSTER_ID,
            keys::DIRECTORY_ADMIN_USER,
            keys::DIRECTORY_ADMIN_PASSWD,
        ],
        Service::Proxy => &[],
        Service::ObjectServer => &[keys::INTERNAL_ENDPOINTS, keys::UNITS_PER_REQUEST],
        Service::AuthServer => &[
            keys::AUTH_HTTP_PORT,
            keys::AUTH_HTTPS_PORT,
            keys::AUTH_DEFAULT_ENDPOINT,
            keys::DIRECTORY_ENDPOINTS,
            keys::DIRECTORY_SERVERS,
            keys::DIRECTORY_ADMIN_USER,
            keys::DIRECTORY_ADMIN_PASSWD,
        ],
        Service::BgScheduler => &[
            keys::INTERNAL_ENDPOINTS,
            keys::BGDELETE_SCHEDULE_INTERVAL,
            keys::BGDELETE_MAX_KEYS,
            keys::BGDELETE_CONSUMERS,
        ],
        Service::BgWorker => &[
            keys::INTERNAL_ENDPOINTS,
            keys::DIRECTORY_ENDPOINTS,
            keys::DIRECTORY_ADMIN_USER,
            keys::DIRECTORY_ADMIN_PASSWD,
            keys::BGDELETE_CONSUMERS,
        ],
    }
}

fn bg_account_params(ctx: &SetupContext) -> std::collections::BTreeMap<String, String> {
    let mut params = std::collections::BTreeMap::new();
    params.insert("account_name".to_string(), BG_ACCOUNT_NAME.to_string());
    params.insert(
        "mail".to_string(),
        format!("{BG_ACCOUNT_NAME}@{}", ctx.cluster_id),
    );
    params.insert("cluster_id".to_string(), ctx.cluster_id.clone());
    params
}

pub(super) fn cluster_mappings(ctx: &SetupContext, layout: &Layout) -> Vec<TransformMapping> {
    let target = layout.cluster_config(ctx);
    vec![
        TransformMapping::new(keys::CLUSTER_ID, target.clone(), StoreFormat::Yaml, "cluster>id"),
        TransformMapping::new(
            keys::DIRECTORY_ADMIN_USER,
            target.clone(),
            StoreFormat::Yaml,
            "cluster>rootdn_user",
        ),
        TransformMapping::new(
            keys::DIRECTORY_ADMIN_PASSWD,
            target,
            StoreFormat::Yaml,
            "cluster>rootdn_pass",
        ),
    ]
}

pub(super) fn object_server_mappings(ctx: &SetupContext, layout: &Layout) -> Vec<TransformMapping> {
    let target = layout.object_config(ctx);
    vec![
        TransformMapping::new(
            keys::INTERNAL_ENDPOINTS,
            target.clone(),
            StoreFormat::Yaml,
            "server>bgdelete_bind_port",
        )
        .with_transform(Transform::BindPort {
            scheme: "http".into(),
        }),
        TransformMapping::new(
            keys::AUTH_DEFAULT_ENDPOINT,
            target.clone(),
            StoreFormat::Yaml,
            "auth>endpoint",
        ),
        TransformMapping::new(
            keys::AUDIT_LOG_POLICY,
            target.clone(),
            StoreFormat::Yaml,
            "server>audit_log_policy",
        ),
        TransformMapping::new(
            keys::BASE_LOG_PATH,
            target.clone(),
            StoreFormat::Yaml,
            "server>log_dir",
        )
        .with_transform(Transform::JoinPath {
            segments: vec![PathSegment::Literal("ostor".into()), PathSegment::NodeId],
        }),
        TransformMapping::new(
            keys::UNITS_PER_REQUEST,
            target,
            StoreFormat::Yaml,
            "io>max_units_per_request",
        )
        .with_transform(Transform::UnitsPerRequest),
    ]
}

pub(super) fn auth_server_mappings(
    ctx: &SetupContext,
    layout: &Layout,
    root_suffix: &str,
) -> Vec<TransformMapping> {
    let target = layout.auth_config(ctx);
    vec![
        TransformMapping::new(
            keys::AUTH_HTTP_PORT,
            target.clone(),
            StoreFormat::Properties,
            "httpPort",
        ),
        TransformMapping::new(
            keys::AUTH_HTTPS_PORT,
            target.clone(),
            StoreFormat::Properties,
            "httpsPort",
        ),
        TransformMapping::new(
            keys::DIRECTORY_ENDPOINTS,
            target.clone(),
            StoreFormat::Properties,
            "ldapHost",
        )
        .with_transform(Transform::EndpointFqdn {
            scheme: "ldap".into(),
        }),
        TransformMapping::new(
            keys::DIRECTORY_ENDPOINTS,
            target.clone(),
            StoreFormat::Properties,
            "ldapPort",
        )
        .with_transform(Transform::EndpointPort {
            scheme: "ldap".into(),
        }),
        TransformMapping::new(
            keys::DIRECTORY_ENDPOINTS,
            target.clone(),
            StoreFormat::Properties,
            "ldapSSLPort",
        )
        .with_transform(Transform::EndpointPort {
            scheme: "ssl".into(),
        }),
        TransformMapping::new(
            keys::AUTH_DEFAULT_ENDPOINT,
            target.clone(),
            StoreFormat::Properties,
            "defaultEndpoint",
        ),
        TransformMapping::new(
            keys::BASE_LOG_PATH,
            target.clone(),
            StoreFormat::Properties,
            "logFilePath",
        )
        .with_transform(Transform::JoinPath {
            segments: vec![
                PathSegment::Literal("auth".into()),
                PathSegment::NodeId,
                PathSegment::Literal("server".into()),
            ],
        }),
        TransformMapping::new(
            keys::DIRECTORY_ADMIN_USER,
            target.clone(),
            StoreFormat::Properties,
            "ldapLoginDN",
        )
        .with_transform(Transform::LoginDn {
            suffix: root_suffix.to_string(),
        }),
        TransformMapping::new(
            keys::DIRECTORY_ADMIN_PASSWD,
            target,
            StoreFormat::Properties,
            "ldapLoginPW",
        ),
    ]
}

pub(super) fn bg_scheduler_mappings(ctx: &SetupContext, layout: &Layout) -> Vec<TransformMapping> {
    let target = layout.bgdelete_config(ctx);
    vec![
        TransformMapping::new(
            keys::INTERNAL_ENDPOINTS,
            target.clone(),
            StoreFormat::Yaml,
            "producer>endpoint",
        )
        .with_transform(Transform::EndpointUrl {
            scheme: "http".into(),
        }),
        TransformMapping::new(
            keys::BGDELETE_SCHEDULE_INTERVAL,
            target.clone(),
            StoreFormat::Yaml,
            "scheduler>schedule_interval",
        ),
        TransformMapping::new(
            keys::BGDELETE_MAX_KEYS,
            target.clone(),
            StoreFormat::Yaml,
            "indexes>max_keys",
        ),
        TransformMapping::new(
            keys::BASE_LOG_PATH,
            target,
            StoreFormat::Yaml,
            "logconfig>scheduler_log_dir",
        )
        .with_transform(Transform::JoinPath {
            segments: vec![
                PathSegment::Literal("ostor".into()),
                PathSegment::Literal("bgdelete".into()),
            ],
        }),
    ]
}

pub(super) fn bg_worker_mappings(ctx: &SetupContext, layout: &Layout) -> Vec<TransformMapping> {
    let target = layout.bgdelete_config(ctx);
    vec![
        // The worker dials the object server's background-delete port, which
        // shifts down on container setups; keep both sides on the same
        // flavor-aware shift.
        TransformMapping::new(
            keys::INTERNAL_ENDPOINTS,
            target.clone(),
            StoreFormat::Yaml,
            "consumer>endpoint",
        )
        .with_transform(Transform::BindUrl {
            scheme: "http".into(),
        }),
        TransformMapping::new(
            keys::BASE_LOG_PATH,
            target,
            StoreFormat::Yaml,
            "logconfig>worker_log_dir",
        )
        .with_transform(Transform::JoinPath {
            segments: vec![
                PathSegment::Literal("ostor".into()),
                PathSegment::NodeId,
                PathSegment::Literal("bgdelete".into()),
            ],
        }),
    ]
}
