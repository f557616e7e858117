use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Identity of this process among cooperating instances.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NodeConfig {
    /// Written into election records. A random id is generated when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl NodeConfig {
    /// Configured instance id, or a fresh random one.
    pub fn resolve_instance_id(&self) -> String {
        match &self.instance_id {
            Some(id) => id.clone(),
            None => format!("dtmpl-{}", nanoid::nanoid!(12)),
        }
    }

    pub(super) fn validate(&self) -> Result<()> {
        if let Some(id) = &self.instance_id {
            if id.trim().is_empty() {
                return Err(Error::Config(ConfigError::Message(
                    "node.instance_id cannot be blank".into(),
                )));
            }
        }
        Ok(())
    }
}
