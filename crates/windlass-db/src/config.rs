use std::env;

/// Database configuration.
///
/// Reads from the `WINDLASS_DATABASE_URL` environment variable, falling back
/// to an on-disk SQLite database at `./var/windlass.db` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full SQLite connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "sqlite://var/windlass.db?mode=rwc";

    /// Build a config from the environment.
    ///
    /// Priority: `WINDLASS_DATABASE_URL` env var, then the compile-time
    /// default.
    pub fn from_env() -> Self {
        let database_url =
            env::var("WINDLASS_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// The filesystem path of the database, when the URL points at a file.
    ///
    /// Returns `None` for in-memory databases.
    pub fn database_path(&self) -> Option<&str> {
        let rest = self.database_url.strip_prefix("sqlite://")?;
        if rest.starts_with(":memory:") {
            return None;
        }
        let path = rest.split('?').next().unwrap_or(rest);
        (!path.is_empty()).then_some(path)
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
