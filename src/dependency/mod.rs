//! Dependency descriptors
//!
//! A [`Dependency`] names one unit of external data a template needs, e.g.
//! the value at a key or the healthy instances of a service. Its identity is
//! a normalized string (`kv:/config/app`, `service:web|tag=prod`) and is the
//! only key used to deduplicate watches across templates and instances.


use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

/// Value fetched for a dependency.
///
/// Backend clients decode their payloads into JSON so values can be compared
/// for change detection and embedded in shared render data unchanged.
pub type DependencyValue = serde_json::Value;

/// Normalized identity of a dependency.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyId(Arc<str>);

impl DependencyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DependencyId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DependencyId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl From<&str> for DependencyId {
    fn from(s: &str) -> Self {
        DependencyId(Arc::from(s))
    }
}

impl From<String> for DependencyId {
    fn from(s: String) -> Self {
        DependencyId(Arc::from(s))
    }
}

impl Borrow<str> for DependencyId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Type tag of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Single value at a key
    KvGet,
    /// All pairs under a prefix
    KvList,
    /// Key names under a prefix
    KvKeys,
    /// Healthy instances of a catalog service
    HealthService,
    /// All services in the catalog
    CatalogServices,
    /// All nodes in the catalog
    CatalogNodes,
    /// Secret engine read
    Secret,
    /// Scheduler registered service
    NomadService,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 8] = [
        DependencyKind::KvGet,
        DependencyKind::KvList,
        DependencyKind::KvKeys,
        DependencyKind::HealthService,
        DependencyKind::CatalogServices,
        DependencyKind::CatalogNodes,
        DependencyKind::Secret,
        DependencyKind::NomadService,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            DependencyKind::KvGet => "kv",
            DependencyKind::KvList => "kv.list",
            DependencyKind::KvKeys => "kv.keys",
            DependencyKind::HealthService => "service",
            DependencyKind::CatalogServices => "catalog.services",
            DependencyKind::CatalogNodes => "catalog.nodes",
            DependencyKind::Secret => "secret",
            DependencyKind::NomadService => "nomad.service",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// Whether a target (key, prefix, service name) is mandatory.
    fn requires_target(&self) -> bool {
        !matches!(self, DependencyKind::CatalogServices | DependencyKind::CatalogNodes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyParseError {
    #[error("missing type tag in {0:?}")]
    MissingTag(String),

    #[error("unknown dependency type {0:?}")]
    UnknownKind(String),

    #[error("dependency type {0} requires a target")]
    MissingTarget(&'static str),

    #[error("invalid parameter {0:?}, expected key=value")]
    InvalidParam(String),

    #[error("invalid escape sequence in {0:?}")]
    InvalidEscape(String),
}

/// Immutable descriptor of one unit of external data.
///
/// Equality and hashing use the identity only.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dependency {
    kind: DependencyKind,
    target: String,
    params: BTreeMap<String, String>,
    id: DependencyId,
}

impl Dependency {
    pub fn new(
        kind: DependencyKind,
        target: impl Into<String>,
        params: BTreeMap<String, String>,
    ) -> Result<Self, DependencyParseError> {
        let target = target.into();
        if kind.requires_target() && target.is_empty() {
            return Err(DependencyParseError::MissingTarget(kind.tag()));
        }
        let id = Self::identity(kind, &target, &params);
        Ok(Self {
            kind,
            target,
            params,
            id,
        })
    }

    /// `kv:<key>` dependency.
    pub fn kv(key: &str) -> Self {
        Self::unchecked(DependencyKind::KvGet, key)
    }

    /// `kv.list:<prefix>` dependency.
    pub fn kv_list(prefix: &str) -> Self {
        Self::unchecked(DependencyKind::KvList, prefix)
    }

    /// `service:<name>` dependency.
    pub fn service(name: &str) -> Self {
        Self::unchecked(DependencyKind::HealthService, name)
    }

    /// `secret:<path>` dependency.
    pub fn secret(path: &str) -> Self {
        Self::unchecked(DependencyKind::Secret, path)
    }

    /// Adds a parameter, re-deriving the identity.
    pub fn with_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.params.insert(key.into(), value.into());
        self.id = Self::identity(self.kind, &self.target, &self.params);
        self
    }

    fn unchecked(
        kind: DependencyKind,
        target: &str,
    ) -> Self {
        let params = BTreeMap::new();
        let id = Self::identity(kind, target, &params);
        Self {
            kind,
            target: target.to_string(),
            params,
            id,
        }
    }

    fn identity(
        kind: DependencyKind,
        target: &str,
        params: &BTreeMap<String, String>,
    ) -> DependencyId {
        let mut id = format!("{}:", kind.tag());
        escape_into(&mut id, target);
        for (k, v) in params {
            id.push('|');
            escape_into(&mut id, k);
            id.push('=');
            escape_into(&mut id, v);
        }
        DependencyId::from(id)
    }

    pub fn id(&self) -> &DependencyId {
        &self.id
    }

    pub fn kind(&self) -> DependencyKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Whether a fetched value may be published through dedup shared data.
    ///
    /// Secret reads stay on the instance that fetched them.
    pub fn can_share(&self) -> bool {
        !matches!(self.kind, DependencyKind::Secret)
    }
}

impl PartialEq for Dependency {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Hash for Dependency {
    fn hash<H: Hasher>(
        &self,
        state: &mut H,
    ) {
        self.id.hash(state)
    }
}

impl PartialOrd for Dependency {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dependency {
    fn cmp(
        &self,
        other: &Self,
    ) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Dependency {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

impl fmt::Debug for Dependency {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Dependency({})", self.id)
    }
}

impl FromStr for Dependency {
    type Err = DependencyParseError;

    /// Parses `<tag>:<target>[|k=v]*`. Whitespace is significant and `%`,
    /// `|` and `=` inside a target, key or value are percent-escaped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, rest) = s
            .split_once(':')
            .ok_or_else(|| DependencyParseError::MissingTag(s.to_string()))?;
        let kind = DependencyKind::from_tag(tag)
            .ok_or_else(|| DependencyParseError::UnknownKind(tag.to_string()))?;

        let mut parts = rest.split('|');
        let target = unescape(parts.next().unwrap_or_default())?;

        let mut params = BTreeMap::new();
        for p in parts {
            let (k, v) = p
                .split_once('=')
                .ok_or_else(|| DependencyParseError::InvalidParam(p.to_string()))?;
            if k.is_empty() {
                return Err(DependencyParseError::InvalidParam(p.to_string()));
            }
            params.insert(unescape(k)?, unescape(v)?);
        }

        Dependency::new(kind, target, params)
    }
}

// Separators of the identity string, escaped wherever they occur in a
// target, parameter key or parameter value.
const ESCAPES: [(char, &str); 3] = [('%', "%25"), ('|', "%7C"), ('=', "%3D")];

fn escape_into(
    out: &mut String,
    raw: &str,
) {
    for c in raw.chars() {
        match ESCAPES.iter().find(|(ch, _)| *ch == c) {
            Some((_, escaped)) => out.push_str(escaped),
            None => out.push(c),
        }
    }
}

fn unescape(raw: &str) -> Result<String, DependencyParseError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos..pos + 3).unwrap_or_default();
        let (c, _) = ESCAPES
            .iter()
            .find(|(_, escaped)| escaped.eq_ignore_ascii_case(code))
            .ok_or_else(|| DependencyParseError::InvalidEscape(raw.to_string()))?;
        out.push(*c);
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

impl TryFrom<String> for Dependency {
    type Error = DependencyParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Dependency> for String {
    fn from(d: Dependency) -> Self {
        d.id.to_string()
    }
}
