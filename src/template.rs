//! Templates as seen by the watch core: an identity plus the dependencies the
//! template references. Parsing and execution live outside this crate.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::Dependency;

/// Stable identity of a template (typically its source path).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(Arc<str>);

impl TemplateId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TemplateId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl From<&str> for TemplateId {
    fn from(s: &str) -> Self {
        TemplateId(Arc::from(s))
    }
}

impl From<String> for TemplateId {
    fn from(s: String) -> Self {
        TemplateId(Arc::from(s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    id: TemplateId,
    dependencies: BTreeSet<Dependency>,
}

impl Template {
    pub fn new(
        id: impl Into<TemplateId>,
        dependencies: impl IntoIterator<Item = Dependency>,
    ) -> Self {
        Self {
            id: id.into(),
            dependencies: dependencies.into_iter().collect(),
        }
    }

    pub fn id(&self) -> &TemplateId {
        &self.id
    }

    pub fn dependencies(&self) -> &BTreeSet<Dependency> {
        &self.dependencies
    }

    /// Dependencies whose values may travel through dedup shared data.
    pub fn shareable_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| d.can_share())
    }

    /// Same template restricted to the dependencies that must always be
    /// fetched locally.
    pub fn local_only(&self) -> Template {
        Template {
            id: self.id.clone(),
            dependencies: self.dependencies.iter().filter(|d| !d.can_share()).cloned().collect(),
        }
    }
}
