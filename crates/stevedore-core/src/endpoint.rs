//! Endpoint descriptors and scheme-based selection.
//!
//! Multiple logical endpoints (HTTP, LDAP, LDAPS) are frequently multiplexed
//! onto one address family; picking by transport scheme decouples "which
//! interface" from "which protocol", and first-match ordering keeps the
//! selection deterministic regardless of store iteration order.

use crate::error::{StevedoreError, StevedoreResult};
use crate::store::Value;
use serde::{Deserialize, Serialize};

/// Structured network-address descriptor tagged with a transport scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: String,
    pub fqdn: String,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Endpoint {
    /// Render as `scheme://fqdn:port`; a missing port is a configuration
    /// error for callers that need a full URL.
    pub fn url(&self) -> StevedoreResult<String> {
        let port = self.port.ok_or_else(|| {
            StevedoreError::Transform(format!(
                "endpoint for scheme '{}' does not specify a port",
                self.scheme
            ))
        })?;
        Ok(format!("{}://{}:{}", self.scheme, self.fqdn, port))
    }
}

/// Decode a [`Value`] into an endpoint sequence.
///
/// The value is either a string-encoded list literal or an already-decoded
/// list; re-decoding a decoded value is a no-op, not an error.
pub fn decode_endpoints(value: &Value) -> StevedoreResult<Vec<Endpoint>> {
    match value {
        Value::Str(raw) => serde_yaml::from_str(raw).map_err(|err| {
            StevedoreError::Store(format!("failed to decode endpoint list '{raw}': {err}"))
        }),
        Value::List(items) => items.iter().map(endpoint_from_value).collect(),
        other => Err(StevedoreError::Store(format!(
            "expected an endpoint list, got: {other}"
        ))),
    }
}

fn endpoint_from_value(value: &Value) -> StevedoreResult<Endpoint> {
    let map = match value {
        Value::Map(map) => map,
        other => {
            return Err(StevedoreError::Store(format!(
                "endpoint entries must be maps, got: {other}"
            )))
        }
    };
    let field = |name: &str| -> Option<String> {
        map.get(name).map(|v| v.to_string())
    };
    let scheme = field("scheme").ok_or_else(|| {
        StevedoreError::Store("endpoint entry is missing the 'scheme' field".into())
    })?;
    let fqdn = field("fqdn").ok_or_else(|| {
        StevedoreError::Store("endpoint entry is missing the 'fqdn' field".into())
    })?;
    let port = match map.get("port") {
        None => None,
        Some(v) => Some(
            v.as_i64()
                .and_then(|n| u16::try_from(n).ok())
                .ok_or_else(|| {
                    StevedoreError::Store(format!("endpoint port '{v}' is not a valid port"))
                })?,
        ),
    };
    Ok(Endpoint { scheme, fqdn, port })
}

/// First endpoint whose scheme matches exactly, or `None`.
///
/// `None` for a required endpoint is a fatal configuration error at the
/// caller, never "use a default".
pub fn select_by_scheme<'a>(endpoints: &'a [Endpoint], scheme: &str) -> Option<&'a Endpoint> {
    endpoints.iter().find(|ep| ep.scheme == scheme)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ep(scheme: &str, fqdn: &str, port: Option<u16>) -> Endpoint {
        Endpoint {
            scheme: scheme.into(),
            fqdn: fqdn.into(),
            port,
        }
    }

    #[test]
    fn selects_first_match_in_sequence_order() {
        let endpoints = vec![
            ep("https", "a.local", Some(443)),
            ep("http", "b.local", Some(80)),
            ep("http", "c.local", Some(81)),
        ];
        let selected = select_by_scheme(&endpoints, "http").unwrap();
        assert_eq!(selected.fqdn, "b.local");
    }

    #[test]
    fn returns_none_when_no_scheme_matches() {
        let endpoints = vec![ep("http", "a.local", Some(80))];
        assert!(select_by_scheme(&endpoints, "ldap").is_none());
        assert!(select_by_scheme(&[], "http").is_none());
    }

    #[test]
    fn decodes_string_literal_endpoint_list() {
        let raw = Value::Str(
            "[{'scheme': 'ldap', 'fqdn': 'dir.local', 'port': 389}, {'scheme': 'ssl', 'fqdn': 'dir.local', 'port': 636}]"
                .into(),
        );
        let endpoints = decode_endpoints(&raw).unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0], ep("ldap", "dir.local", Some(389)));
        assert_eq!(endpoints[1], ep("ssl", "dir.local", Some(636)));
    }

    #[test]
    fn decoding_already_decoded_list_is_a_no_op() {
        let entry = |scheme: &str, fqdn: &str, port: i64| {
            let mut map = BTreeMap::new();
            map.insert("scheme".to_string(), Value::Str(scheme.into()));
            map.insert("fqdn".to_string(), Value::Str(fqdn.into()));
            map.insert("port".to_string(), Value::Int(port));
            Value::Map(map)
        };
        let decoded = Value::List(vec![entry("http", "a.local", 80)]);
        let first = decode_endpoints(&decoded).unwrap();
        let second = decode_endpoints(&decoded).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![ep("http", "a.local", Some(80))]);
    }

    #[test]
    fn endpoint_without_port_cannot_render_url() {
        let endpoint = ep("http", "a.local", None);
        assert!(matches!(
            endpoint.url(),
            Err(StevedoreError::Transform(_))
        ));
        assert_eq!(
            ep("http", "a.local", Some(8080)).url().unwrap(),
            "http://a.local:8080"
        );
    }
}
