use std::collections::HashMap;

use anyhow::{bail, Result};
use vds::VdsError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
}

/// Decides whether a caller may act on a log or map.
///
/// Consulted by the handlers before any call into the service.
pub trait AuthorizationOracle: Send + Sync {
    fn verify_allowed(&self, api_key: Option<&str>, object_name: &str, permission: Permission) -> vds::Result<()>;
}

/// Fixed set of API keys and the permissions each one carries.
///
/// Parsed from `key=rw,other=r` where `r` grants reads and `w` grants writes.
/// With no keys configured every request is allowed.
#[derive(Debug, Default)]
pub struct StaticOracle {
    keys: HashMap<String, Vec<Permission>>,
}

impl StaticOracle {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut keys = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((key, perms)) = entry.split_once('=') else {
                bail!("API key entry `{entry}` must look like key=rw");
            };
            let mut granted = Vec::new();
            for c in perms.chars() {
                match c {
                    'r' => granted.push(Permission::Read),
                    'w' => granted.push(Permission::Write),
                    other => bail!("unknown permission `{other}` for API key entry `{entry}`"),
                }
            }
            keys.insert(key.to_string(), granted);
        }
        Ok(Self { keys })
    }

    pub fn is_open(&self) -> bool {
        self.keys.is_empty()
    }
}

impl AuthorizationOracle for StaticOracle {
    fn verify_allowed(&self, api_key: Option<&str>, object_name: &str, permission: Permission) -> vds::Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let allowed = api_key
            .and_then(|k| self.keys.get(k))
            .map(|granted| granted.contains(&permission))
            .unwrap_or(false);
        if !allowed {
            tracing::debug!(object_name, ?permission, "auth: denied");
            return Err(VdsError::NotAuthorized);
        }
        Ok(())
    }
}
