use anyhow::Context;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Base seed for reproducible simulation runs.
    pub simulation_seed: Option<u64>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let max_connections = match lookup("CKD_MAX_CONNECTIONS") {
            Some(value) => value
                .parse::<u32>()
                .with_context(|| format!("CKD_MAX_CONNECTIONS must be a positive integer, got '{value}'"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        let simulation_seed = lookup("CKD_SIMULATION_SEED")
            .map(|value| {
                value
                    .parse::<u64>()
                    .with_context(|| format!("CKD_SIMULATION_SEED must be an unsigned integer, got '{value}'"))
            })
            .transpose()?;

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            max_connections,
            simulation_seed,
        })
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.simulation_seed, None);
        assert!(config.database_url().is_err());
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/ckd"),
            ("CKD_MAX_CONNECTIONS", "12"),
            ("CKD_SIMULATION_SEED", "42"),
        ]))
        .unwrap();
        assert_eq!(config.database_url().unwrap(), "postgres://localhost/ckd");
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.simulation_seed, Some(42));
    }

    #[test]
    fn rejects_malformed_seed() {
        assert!(Config::from_lookup(lookup(&[("CKD_SIMULATION_SEED", "abc")])).is_err());
    }
}
