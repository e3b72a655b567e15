use std::{fmt, time::Duration};

use crate::schema::{DEFAULT_DATABASE, DEFAULT_PRINCIPAL};

/// Where the datastore is and who to talk to it as.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Full connection string. Takes precedence over `host`/`port` when set.
    pub uri: Option<String>,
    pub host: String,
    pub port: u16,
    /// Administrative credentials; `None` connects unauthenticated.
    pub admin: Option<Credentials>,
    /// Database the admin credentials are defined in.
    pub auth_source: String,
    /// Target database holding the upload collections.
    pub database: String,
    pub server_selection_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: None,
            host: "localhost".to_string(),
            port: 27017,
            admin: None,
            auth_source: "admin".to_string(),
            database: DEFAULT_DATABASE.to_string(),
            server_selection_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Human readable target for log lines. Never includes credentials.
    pub fn target(&self) -> String {
        match &self.uri {
            Some(_) => format!("<uri>/{}", self.database),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The application principal the initializer provisions.
#[derive(Clone, Debug)]
pub struct Principal {
    pub credentials: Credentials,
    /// Database the principal is created in and granted `readWrite` on.
    pub database: String,
}

impl Principal {
    pub fn new(database: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            credentials,
            database: database.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.credentials.username
    }

    pub fn with_default_name(database: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(database, Credentials::new(DEFAULT_PRINCIPAL, password))
    }
}

/// Connection flags shared by the binaries.
#[cfg(feature = "cli")]
#[derive(clap::Args, Clone, Debug)]
pub struct ConnectionArgs {
    /// Full connection string; overrides --host and --port
    #[arg(long, env = "MONGODB_URI", hide_env_values = true)]
    pub uri: Option<String>,

    #[arg(long, env = "MONGODB_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long, env = "MONGODB_PORT", default_value_t = 27017)]
    pub port: u16,

    #[arg(long, env = "MONGODB_ADMIN_USER", requires = "admin_password")]
    pub admin_user: Option<String>,

    #[arg(long, env = "MONGODB_ADMIN_PASSWORD", hide_env_values = true)]
    pub admin_password: Option<String>,

    /// Database the admin user is defined in
    #[arg(long, env = "MONGODB_AUTH_SOURCE", default_value = "admin")]
    pub auth_source: String,

    #[arg(long, env = "FILEUPLOADER_DATABASE", default_value = DEFAULT_DATABASE)]
    pub database: String,

    /// Seconds to wait for a usable server
    #[arg(long, env = "MONGODB_SERVER_SELECTION_TIMEOUT", default_value_t = 30)]
    pub server_selection_timeout: u64,
}

#[cfg(feature = "cli")]
impl From<ConnectionArgs> for ConnectionConfig {
    fn from(args: ConnectionArgs) -> Self {
        let admin = match (args.admin_user, args.admin_password) {
            (Some(user), Some(password)) => Some(Credentials::new(user, password)),
            _ => None,
        };
        Self {
            uri: args.uri,
            host: args.host,
            port: args.port,
            admin,
            auth_source: args.auth_source,
            database: args.database,
            server_selection_timeout: Duration::from_secs(args.server_selection_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_passwords() {
        let principal = Principal::with_default_name("fileUploader", "hunter2");
        let rendered = format!("{principal:?}");
        assert!(rendered.contains("fileUploader"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn target_hides_uri() {
        let mut config = ConnectionConfig::default();
        assert_eq!(config.target(), "localhost:27017/fileUploader");
        config.uri = Some("mongodb://root:secret@db:27017".to_string());
        assert!(!config.target().contains("secret"));
    }

    #[cfg(feature = "cli")]
    #[test]
    fn flags_become_connection_config() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            connection: ConnectionArgs,
        }

        let cli = Cli::try_parse_from([
            "init",
            "--host",
            "db.internal",
            "--port",
            "27018",
            "--admin-user",
            "root",
            "--admin-password",
            "example",
            "--server-selection-timeout",
            "5",
        ])
        .unwrap();
        let config = ConnectionConfig::from(cli.connection);
        assert_eq!(config.target(), "db.internal:27018/fileUploader");
        assert_eq!(config.admin.map(|c| c.username).as_deref(), Some("root"));
        assert_eq!(config.server_selection_timeout, Duration::from_secs(5));
    }
}
