//! Upstream LDAP connections
//!
//! The relay never talks to `ldap3` directly: it goes through [`Connector`] and
//! [`UpstreamConnection`] so sessions and probes can be exercised without a
//! directory server.

use crate::error::{RelayError, RelayResult};
use crate::proto::{Attribute, Control, DerefAliases, Entry, ResultCode, Scope, SearchRequest};
use crate::registry::{Endpoint, Scheme};
use async_trait::async_trait;
use ldap3::asn1::StructureTag;
use ldap3::controls::RawControl;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, SearchEntry, SearchOptions};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// What an upstream search produced before any reshaping
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSearch {
    pub entries: Vec<Entry>,
    pub references: Vec<String>,
    pub referrals: Vec<String>,
    pub controls: Vec<Control>,
    pub code: ResultCode,
    pub message: String,
}

/// An open connection to one upstream server
#[async_trait]
pub trait UpstreamConnection: Send {
    /// Simple bind. A non-success result code is returned as [`RelayError::Rejected`].
    async fn bind(&mut self, dn: &str, password: &str) -> RelayResult<()>;

    /// Run a search. Non-success result codes are reported in the returned
    /// value; `Err` means the connection itself failed.
    async fn search(&mut self, request: &SearchRequest) -> RelayResult<UpstreamSearch>;

    /// Close the connection. Errors are only logged.
    async fn close(&mut self);
}

/// Opens upstream connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> RelayResult<Box<dyn UpstreamConnection>>;
}

/// [`Connector`] backed by the `ldap3` async client
#[derive(Debug, Clone, Default)]
pub struct Ldap3Connector {
    /// Skip certificate verification for `ldaps://` upstreams
    pub insecure: bool,
    /// Optional bound on connection establishment
    pub dial_timeout: Option<Duration>,
}

impl Ldap3Connector {
    pub fn new(insecure: bool, dial_timeout: Option<Duration>) -> Self {
        Self {
            insecure,
            dial_timeout,
        }
    }

    fn settings(&self, endpoint: &Endpoint) -> LdapConnSettings {
        let mut settings = LdapConnSettings::new();
        if endpoint.scheme == Scheme::Ldaps && self.insecure {
            settings = settings.set_no_tls_verify(true);
        }
        if let Some(timeout) = self.dial_timeout {
            settings = settings.set_conn_timeout(timeout);
        }
        settings
    }
}

#[async_trait]
impl Connector for Ldap3Connector {
    async fn connect(&self, endpoint: &Endpoint) -> RelayResult<Box<dyn UpstreamConnection>> {
        let url = endpoint.url();
        debug!("connecting to {}", url);

        let (conn, ldap) = LdapConnAsync::with_settings(self.settings(endpoint), &url)
            .await
            .map_err(|e| RelayError::dial(endpoint.address(), e))?;

        let address = endpoint.address();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(%address, error = %e, "upstream connection driver stopped");
            }
        });

        Ok(Box::new(Ldap3Connection { ldap }))
    }
}

struct Ldap3Connection {
    ldap: Ldap,
}

fn ldap3_scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

fn ldap3_deref(deref: DerefAliases) -> ldap3::DerefAliases {
    match deref {
        DerefAliases::Never => ldap3::DerefAliases::Never,
        DerefAliases::InSearching => ldap3::DerefAliases::Searching,
        DerefAliases::FindingBaseObject => ldap3::DerefAliases::Finding,
        DerefAliases::Always => ldap3::DerefAliases::Always,
    }
}

/// URIs of a continuation reference; undecodable parts are dropped
fn reference_uris(tag: StructureTag) -> Vec<String> {
    tag.expect_constructed()
        .unwrap_or_default()
        .into_iter()
        .filter_map(StructureTag::expect_primitive)
        .filter_map(|uri| String::from_utf8(uri).ok())
        .collect()
}

/// Merge text and binary values, attributes sorted by name for stable output
fn convert_entry(entry: SearchEntry) -> Entry {
    let mut attributes: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
    for (name, values) in entry.attrs {
        attributes
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(String::into_bytes));
    }
    for (name, values) in entry.bin_attrs {
        attributes.entry(name).or_default().extend(values);
    }

    Entry {
        dn: entry.dn,
        attributes: attributes
            .into_iter()
            .map(|(name, values)| Attribute { name, values })
            .collect(),
    }
}

#[async_trait]
impl UpstreamConnection for Ldap3Connection {
    async fn bind(&mut self, dn: &str, password: &str) -> RelayResult<()> {
        let result = self
            .ldap
            .simple_bind(dn, password)
            .await
            .map_err(RelayError::upstream)?;

        if result.rc == 0 {
            Ok(())
        } else {
            Err(RelayError::Rejected {
                code: result.rc,
                message: result.text,
            })
        }
    }

    async fn search(&mut self, request: &SearchRequest) -> RelayResult<UpstreamSearch> {
        let options = SearchOptions::new()
            .deref(ldap3_deref(request.deref_aliases))
            .typesonly(request.types_only)
            .sizelimit(request.size_limit)
            .timelimit(request.time_limit);

        let controls: Vec<RawControl> = request
            .controls
            .iter()
            .map(|c| RawControl {
                ctype: c.oid.clone(),
                crit: c.critical,
                val: c.value.clone(),
            })
            .collect();

        self.ldap.with_search_options(options);
        if !controls.is_empty() {
            self.ldap.with_controls(controls);
        }

        let mut stream = self
            .ldap
            .streaming_search(
                &request.base_dn,
                ldap3_scope(request.scope),
                &request.filter,
                request.attributes.clone(),
            )
            .await
            .map_err(RelayError::upstream)?;

        let mut entries = Vec::new();
        let mut references = Vec::new();
        while let Some(raw) = stream.next().await.map_err(RelayError::upstream)? {
            if raw.is_ref() {
                references.extend(reference_uris(raw.0));
            } else if raw.is_intermediate() {
                debug!("skipping intermediate search response");
            } else {
                entries.push(convert_entry(SearchEntry::construct(raw)));
            }
        }
        let result = stream.finish().await;

        Ok(UpstreamSearch {
            entries,
            references,
            referrals: result.refs,
            controls: result
                .ctrls
                .into_iter()
                .map(|c| Control {
                    oid: c.1.ctype,
                    critical: c.1.crit,
                    value: c.1.val,
                })
                .collect(),
            code: ResultCode::from(result.rc),
            message: result.text,
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            debug!(error = %e, "unbind on close failed");
        }
    }
}
