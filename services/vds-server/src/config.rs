use std::time::Duration;

use anyhow::{bail, Context, Result};
use vds::BatchMutatorConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutatorKind {
    Instant,
    Batch,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub mutator: MutatorKind,
    pub batch: BatchMutatorConfig,
    /// Raw `VDS_API_KEYS` value, parsed by the oracle
    pub api_keys: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("VDS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let mutator = match std::env::var("VDS_MUTATOR").as_deref() {
            Err(_) | Ok("batch") => MutatorKind::Batch,
            Ok("instant") => MutatorKind::Instant,
            Ok(other) => bail!("VDS_MUTATOR must be `instant` or `batch`, got `{other}`"),
        };

        let defaults = BatchMutatorConfig::default();
        let batch = BatchMutatorConfig {
            batch_size: parse_or("VDS_BATCH_SIZE", defaults.batch_size)?,
            timeout: Duration::from_millis(parse_or(
                "VDS_BATCH_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )?),
            buffer_size: parse_or("VDS_BATCH_BUFFER", defaults.buffer_size)?,
        };
        if batch.batch_size == 0 {
            bail!("VDS_BATCH_SIZE must be at least 1");
        }

        let api_keys = std::env::var("VDS_API_KEYS").unwrap_or_default();

        Ok(Self {
            bind_addr,
            mutator,
            batch,
            api_keys,
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for env var {key}: {v}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_to_default() {
        let v: usize = parse_or("VDS_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(v, 42);
    }
}
