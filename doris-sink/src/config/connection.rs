use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Where and as whom to load. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    fenodes: Vec<String>,
    database: String,
    table: String,
    username: String,
    password: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ConnectionOptions {
    pub fn builder() -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder::default()
    }

    pub fn fenodes(&self) -> &[String] {
        &self.fenodes
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Stream load url of the table on the given FE node. Nodes without a scheme are plain http.
    pub(crate) fn load_url(&self, fenode: &str) -> String {
        let base = if fenode.contains("://") {
            fenode.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", fenode.trim_end_matches('/'))
        };
        format!("{base}/api/{}/{}/_stream_load", self.database, self.table)
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("fenodes", &self.fenodes)
            .field("database", &self.database)
            .field("table", &self.table)
            .field("username", &self.username)
            .field("password", &"***")
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Builder for [ConnectionOptions]. Endpoints and table identifier are required.
#[derive(Debug, Default)]
pub struct ConnectionOptionsBuilder {
    fenodes: Vec<String>,
    table_identifier: Option<String>,
    username: String,
    password: String,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl ConnectionOptionsBuilder {
    /// Comma separated `host:port` list, e.g. `"fe1:8030,fe2:8030"`.
    pub fn fenode_list(mut self, fenodes: &str) -> Self {
        self.fenodes = fenodes.split(',').map(str::to_string).collect();
        self
    }

    pub fn fenodes<S: Into<String>>(mut self, fenodes: impl IntoIterator<Item = S>) -> Self {
        self.fenodes = fenodes.into_iter().map(Into::into).collect();
        self
    }

    /// `"<db>.<table>"`
    pub fn table_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.table_identifier = Some(identifier.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ConnectionOptions> {
        let fenodes: Vec<String> = self
            .fenodes
            .iter()
            .map(|node| node.trim().to_string())
            .filter(|node| !node.is_empty())
            .collect();
        if fenodes.is_empty() {
            return Err(Error::Config("fenodes must not be empty".to_string()));
        }

        let identifier = self
            .table_identifier
            .ok_or_else(|| Error::Config("table identifier is required".to_string()))?;
        let (database, table) = match identifier.trim().split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() && !table.contains('.') => {
                (db.to_string(), table.to_string())
            }
            _ => {
                return Err(Error::Config(format!(
                    "table identifier {identifier:?} is not of the form <db>.<table>"
                )));
            }
        };

        Ok(ConnectionOptions {
            fenodes,
            database,
            table,
            username: self.username,
            password: self.password,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        })
    }
}
