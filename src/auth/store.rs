//! Encrypted, database-backed named-session credential store
//!
//! Rows live in the `saved_authentications` table, unique on
//! `(provider, auth_type, name)`. Credential maps are encrypted before they
//! reach SQLite; callers only ever see plaintext JSON maps.

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::OnceLock;

use super::context::{from_unix_secs, AuthType, Credentials, Provider};
use super::encryption::SecretEncryptor;
use crate::error::Error;
use crate::Result;

const NAME_PATTERN: &str = r"^[A-Za-z0-9_-]{3,50}$";

/// Top-level attribute keys folded into `credentials` when no wrapper is given
const LOOSE_CREDENTIAL_KEYS: &[&str] = &[
    "api_key",
    "access_token",
    "refresh_token",
    "token_type",
    "scope",
];

/// A persisted named session
#[derive(Debug, Clone, PartialEq)]
pub struct SavedAuthentication {
    pub id: String,
    pub provider: Provider,
    pub auth_type: AuthType,
    pub name: String,
    pub credentials: Map<String, Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Writable attributes of a named session, in canonical shape
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionAttrs {
    pub credentials: Map<String, Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionAttrs {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            credentials: credentials.to_map(),
            expires_at: credentials.expires_at(),
        }
    }

    /// Normalize loosely-shaped input into the canonical `credentials` shape.
    ///
    /// Accepts either `{"credentials": {...}, "expires_at": ...}` or the
    /// individual `api_key` / `access_token` / `refresh_token` / `token_type` /
    /// `scope` fields at the top level. `expires_at` may be RFC 3339 or unix
    /// seconds.
    pub fn normalize(input: &Value) -> Result<Self> {
        let obj = input.as_object().ok_or_else(|| {
            Error::InvalidCredentialFormat("session attributes must be an object".into())
        })?;

        let credentials = match obj.get("credentials") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(Error::InvalidCredentialFormat(
                    "'credentials' must be an object".into(),
                ))
            }
            None => LOOSE_CREDENTIAL_KEYS
                .iter()
                .filter_map(|k| obj.get(*k).map(|v| (k.to_string(), v.clone())))
                .collect(),
        };

        let expires_at = match obj.get("expires_at") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| {
                        Error::InvalidCredentialFormat(format!("invalid expires_at '{s}': {e}"))
                    })?
                    .with_timezone(&Utc),
            ),
            Some(Value::Number(n)) => {
                let secs = n.as_i64().ok_or_else(|| {
                    Error::InvalidCredentialFormat(format!("invalid expires_at {n}"))
                })?;
                Some(from_unix_secs(secs).ok_or_else(|| {
                    Error::InvalidCredentialFormat(format!("expires_at out of range: {secs}"))
                })?)
            }
            Some(other) => {
                return Err(Error::InvalidCredentialFormat(format!(
                    "invalid expires_at {other}"
                )))
            }
        };

        Ok(Self {
            credentials,
            expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuthRow {
    id: String,
    provider: String,
    auth_type: String,
    name: String,
    credentials: Vec<u8>,
    expires_at: Option<i64>,
    inserted_at: i64,
    updated_at: i64,
}

/// SQLite-backed credential store
#[derive(Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
    encryptor: SecretEncryptor,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool, encryptor: SecretEncryptor) -> Self {
        Self { pool, encryptor }
    }

    /// Open (creating if missing) the database at `url` and ensure the schema
    pub async fn connect(url: &str, encryptor: SecretEncryptor) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init(&pool).await?;
        Ok(Self::new(pool, encryptor))
    }

    /// Private in-memory database, mainly for tests
    pub async fn in_memory(encryptor: SecretEncryptor) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::init(&pool).await?;
        Ok(Self::new(pool, encryptor))
    }

    /// Create the `saved_authentications` table if it doesn't exist.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS saved_authentications (
                id          TEXT PRIMARY KEY,
                provider    TEXT NOT NULL,
                auth_type   TEXT NOT NULL CHECK (auth_type IN ('api_key', 'oauth')),
                name        TEXT NOT NULL,
                credentials BLOB NOT NULL,
                expires_at  INTEGER,
                inserted_at INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                UNIQUE (provider, auth_type, name)
            )"#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS saved_authentications_provider ON saved_authentications (provider)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Insert a new named session; fails if the key already exists
    pub async fn create(
        &self,
        provider: Provider,
        auth_type: AuthType,
        name: &str,
        attrs: SessionAttrs,
    ) -> Result<SavedAuthentication> {
        validate(auth_type, name, &attrs)?;
        let now = now_ms();
        let blob = self.seal(&attrs.credentials)?;

        let inserted = sqlx::query(
            r#"INSERT INTO saved_authentications
               (id, provider, auth_type, name, credentials, expires_at, inserted_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(provider.as_str())
        .bind(auth_type.as_str())
        .bind(name)
        .bind(blob)
        .bind(attrs.expires_at.map(|t| t.timestamp()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db)) if db.is_unique_violation() => {
                return Err(Error::DuplicateNamedSession {
                    provider,
                    auth_type,
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Created {} {} session '{}'", provider, auth_type, name);
        self.require(provider, auth_type, name).await
    }

    /// Insert or replace credentials/expiry of a named session.
    ///
    /// Concurrent writers are serialized by the unique key; last writer wins.
    pub async fn upsert(
        &self,
        provider: Provider,
        auth_type: AuthType,
        name: &str,
        attrs: SessionAttrs,
    ) -> Result<SavedAuthentication> {
        validate(auth_type, name, &attrs)?;
        let now = now_ms();
        let blob = self.seal(&attrs.credentials)?;

        sqlx::query(
            r#"INSERT INTO saved_authentications
               (id, provider, auth_type, name, credentials, expires_at, inserted_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(provider, auth_type, name) DO UPDATE SET
                 credentials = excluded.credentials,
                 expires_at  = excluded.expires_at,
                 updated_at  = MAX(excluded.updated_at, saved_authentications.updated_at + 1)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(provider.as_str())
        .bind(auth_type.as_str())
        .bind(name)
        .bind(blob)
        .bind(attrs.expires_at.map(|t| t.timestamp()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Upserted {} {} session '{}'", provider, auth_type, name);
        self.require(provider, auth_type, name).await
    }

    pub async fn get(
        &self,
        provider: Provider,
        auth_type: AuthType,
        name: &str,
    ) -> Result<Option<SavedAuthentication>> {
        let row = sqlx::query_as::<_, AuthRow>(
            "SELECT * FROM saved_authentications WHERE provider = ? AND auth_type = ? AND name = ?",
        )
        .bind(provider.as_str())
        .bind(auth_type.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.decode(r)).transpose()
    }

    /// All sessions for one provider, ordered by auth type then name
    pub async fn list(&self, provider: Provider) -> Result<Vec<SavedAuthentication>> {
        let rows = sqlx::query_as::<_, AuthRow>(
            "SELECT * FROM saved_authentications WHERE provider = ? ORDER BY auth_type, name",
        )
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.decode(r)).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<SavedAuthentication>> {
        let rows = sqlx::query_as::<_, AuthRow>(
            "SELECT * FROM saved_authentications ORDER BY provider, auth_type, name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.decode(r)).collect()
    }

    /// Copy a named session's credentials under a new name
    pub async fn clone_session(
        &self,
        provider: Provider,
        auth_type: AuthType,
        from_name: &str,
        to_name: &str,
    ) -> Result<SavedAuthentication> {
        let source = self
            .get(provider, auth_type, from_name)
            .await?
            .ok_or_else(|| Error::SessionNotFound {
                provider,
                auth_type,
                name: from_name.to_string(),
            })?;

        self.create(
            provider,
            auth_type,
            to_name,
            SessionAttrs {
                credentials: source.credentials,
                expires_at: source.expires_at,
            },
        )
        .await
    }

    /// Delete a named session. Deleting a missing session succeeds.
    pub async fn delete(&self, provider: Provider, auth_type: AuthType, name: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM saved_authentications WHERE provider = ? AND auth_type = ? AND name = ?",
        )
        .bind(provider.as_str())
        .bind(auth_type.as_str())
        .bind(name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!("No {} {} session '{}' to delete", provider, auth_type, name);
        } else {
            tracing::info!("Deleted {} {} session '{}'", provider, auth_type, name);
        }
        Ok(())
    }

    async fn require(
        &self,
        provider: Provider,
        auth_type: AuthType,
        name: &str,
    ) -> Result<SavedAuthentication> {
        self.get(provider, auth_type, name)
            .await?
            .ok_or_else(|| Error::Database(sqlx::Error::RowNotFound))
    }

    fn seal(&self, credentials: &Map<String, Value>) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(credentials)?;
        self.encryptor.encrypt(&plaintext)
    }

    fn decode(&self, row: AuthRow) -> Result<SavedAuthentication> {
        let plaintext = self.encryptor.decrypt(&row.credentials)?;
        let credentials: Map<String, Value> = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::InvalidCredentialFormat(format!("stored credentials: {e}")))?;

        Ok(SavedAuthentication {
            id: row.id,
            provider: row.provider.parse()?,
            auth_type: row.auth_type.parse()?,
            name: row.name,
            credentials,
            expires_at: row.expires_at.and_then(from_unix_secs),
            inserted_at: from_millis(row.inserted_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

fn name_regex() -> Option<&'static Regex> {
    static NAME_RE: OnceLock<Option<Regex>> = OnceLock::new();
    NAME_RE.get_or_init(|| Regex::new(NAME_PATTERN).ok()).as_ref()
}

/// Check a session name against `[A-Za-z0-9_-]{3,50}`
pub fn is_valid_session_name(name: &str) -> bool {
    name_regex().is_some_and(|re| re.is_match(name))
}

fn validate(auth_type: AuthType, name: &str, attrs: &SessionAttrs) -> Result<()> {
    if !is_valid_session_name(name) {
        return Err(Error::Validation(format!(
            "session name '{name}' must be 3-50 characters of letters, digits, '_' or '-'"
        )));
    }

    let required = match auth_type {
        AuthType::ApiKey => "api_key",
        AuthType::OAuth => "access_token",
    };
    if !attrs.credentials.get(required).is_some_and(Value::is_string) {
        return Err(Error::InvalidCredentialFormat(format!(
            "{auth_type} credentials require '{required}'"
        )));
    }

    if auth_type == AuthType::OAuth && attrs.expires_at.is_none() {
        return Err(Error::Validation(
            "oauth sessions require expires_at".to_string(),
        ));
    }

    Ok(())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
