//! SQLite datastore implementation

use super::{AppConfigStore, Cursor, CursorStorage, Datastore};
use crate::model::{
    AppConfig, EnrollmentProfile, EnrollmentProfilePayload, EnrollmentType, SetupAssistant, Team,
    TeamConfig, TeamScope,
};
use crate::{AssignerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use depapi::Device;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed store for app config, profiles, teams, hosts and the DEP
/// cursor
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

fn now_str() -> String {
    format_time(Utc::now())
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AssignerError::Storage(format!("invalid timestamp {:?}: {}", s, e)))
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "Opening datastore");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
            path,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Database file path (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AssignerError::Storage("datastore connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS app_config_json (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                json_value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS enrollment_profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL UNIQUE,
                dep_profile TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS teams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS setup_assistants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                team_key INTEGER NOT NULL UNIQUE,
                name TEXT NOT NULL,
                profile TEXT NOT NULL,
                profile_uuid TEXT NOT NULL DEFAULT '',
                uploaded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS default_setup_assistants (
                team_key INTEGER PRIMARY KEY,
                profile_uuid TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hardware_serial TEXT NOT NULL UNIQUE,
                hardware_model TEXT NOT NULL DEFAULT '',
                platform TEXT NOT NULL,
                team_id INTEGER,
                pending INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS host_dep_assignments (
                host_id INTEGER PRIMARY KEY,
                profile_uuid TEXT NOT NULL DEFAULT '',
                assigned_by TEXT NOT NULL DEFAULT '',
                added_at TEXT NOT NULL,
                FOREIGN KEY (host_id) REFERENCES hosts(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS dep_cursors (
                name TEXT PRIMARY KEY,
                cursor TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_hosts_team ON hosts(team_id);
            "#,
        )?;

        Ok(())
    }

    fn load_app_config(conn: &Connection) -> Result<AppConfig> {
        let raw: Option<String> = conn
            .query_row("SELECT json_value FROM app_config_json WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(AppConfig::default()),
        }
    }

    fn load_team(conn: &Connection, sql: &str, key: &dyn rusqlite::ToSql) -> Result<Option<Team>> {
        let row: Option<(i64, String, String)> = conn
            .query_row(sql, [key], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()?;

        row.map(|(id, name, config)| {
            let config: TeamConfig = serde_json::from_str(&config)?;
            Ok(Team {
                id: u32::try_from(id)
                    .map_err(|_| AssignerError::Storage(format!("invalid team id {}", id)))?,
                name,
                config,
            })
        })
        .transpose()
    }

    /// Create a team
    pub fn create_team(&self, name: &str, enable_end_user_auth: bool) -> Result<Team> {
        let conn = self.conn()?;
        let mut config = TeamConfig::default();
        config.mdm.macos_setup.enable_end_user_authentication = enable_end_user_auth;

        conn.execute(
            "INSERT INTO teams (name, config, created_at) VALUES (?1, ?2, ?3)",
            params![name, serde_json::to_string(&config)?, now_str()],
        )?;
        let id = conn.last_insert_rowid();

        tracing::info!(team_id = id, name = %name, "Created team");

        Ok(Team {
            id: u32::try_from(id)
                .map_err(|_| AssignerError::Storage(format!("invalid team id {}", id)))?,
            name: name.to_string(),
            config,
        })
    }

    /// Upload (or replace) the custom setup assistant of a scope
    ///
    /// Replacing the content drops the registered profile UUID and bumps
    /// `uploaded_at`, so the new content is registered on the next pass.
    /// Uploading identical content is a no-op.
    pub fn set_setup_assistant(
        &self,
        scope: TeamScope,
        name: &str,
        profile: &str,
    ) -> Result<SetupAssistant> {
        // Reject content that can never be registered
        serde_json::from_str::<depapi::Profile>(profile)?;

        let conn = self.conn()?;
        let key = scope.storage_key();

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT name, profile FROM setup_assistants WHERE team_key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((ref old_name, ref old_profile)) if old_profile == profile => {
                if old_name != name {
                    conn.execute(
                        "UPDATE setup_assistants SET name = ?2 WHERE team_key = ?1",
                        params![key, name],
                    )?;
                }
            }
            Some(_) => {
                conn.execute(
                    "UPDATE setup_assistants SET name = ?2, profile = ?3, profile_uuid = '', uploaded_at = ?4 WHERE team_key = ?1",
                    params![key, name, profile, now_str()],
                )?;
                tracing::info!(scope = %scope, "Setup assistant content changed, registration reset");
            }
            None => {
                conn.execute(
                    "INSERT INTO setup_assistants (team_key, name, profile, profile_uuid, uploaded_at) VALUES (?1, ?2, ?3, '', ?4)",
                    params![key, name, profile, now_str()],
                )?;
            }
        }

        Self::load_setup_assistant(&conn, scope)?
            .ok_or_else(|| AssignerError::NotFound(format!("setup assistant for {}", scope)))
    }

    /// Remove the custom setup assistant of a scope
    pub fn delete_setup_assistant(&self, scope: TeamScope) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM setup_assistants WHERE team_key = ?1",
            [scope.storage_key()],
        )?;
        Ok(())
    }

    fn load_setup_assistant(conn: &Connection, scope: TeamScope) -> Result<Option<SetupAssistant>> {
        let row: Option<(i64, String, String, String, String)> = conn
            .query_row(
                "SELECT id, name, profile, profile_uuid, uploaded_at FROM setup_assistants WHERE team_key = ?1",
                [scope.storage_key()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        row.map(|(id, name, profile, profile_uuid, uploaded_at)| {
            Ok(SetupAssistant {
                id: id as u32,
                team_id: scope.team_id(),
                name,
                profile,
                profile_uuid,
                uploaded_at: parse_time(&uploaded_at)?,
            })
        })
        .transpose()
    }

    /// All host serials, sorted
    pub fn host_serials(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT hardware_serial FROM hosts ORDER BY hardware_serial")?;
        let serials = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(serials)
    }

    /// Serials of hosts currently linked to DEP, sorted
    pub fn dep_assigned_serials(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT h.hardware_serial FROM host_dep_assignments a JOIN hosts h ON h.id = a.host_id ORDER BY h.hardware_serial",
        )?;
        let serials = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(serials)
    }

    /// Team a host was placed into
    pub fn host_team(&self, serial: &str) -> Result<Option<u32>> {
        let team_id: Option<Option<i64>> = self
            .conn()?
            .query_row(
                "SELECT team_id FROM hosts WHERE hardware_serial = ?1",
                [serial],
                |row| row.get(0),
            )
            .optional()?;

        match team_id {
            Some(team_id) => Ok(team_id.and_then(|id| u32::try_from(id).ok())),
            None => Err(AssignerError::NotFound(format!("host {}", serial))),
        }
    }
}

#[async_trait]
impl AppConfigStore for SqliteStore {
    async fn app_config(&self) -> Result<AppConfig> {
        let conn = self.conn()?;
        Self::load_app_config(&conn)
    }

    async fn save_app_config(&self, config: &AppConfig) -> Result<()> {
        let raw = serde_json::to_string(config)?;
        self.conn()?.execute(
            "INSERT INTO app_config_json (id, json_value, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET json_value = excluded.json_value, updated_at = excluded.updated_at",
            params![raw, now_str()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn enrollment_profile_by_type(
        &self,
        enrollment_type: EnrollmentType,
    ) -> Result<EnrollmentProfile> {
        let conn = self.conn()?;
        let row: Option<(i64, String, Option<String>, String, String)> = conn
            .query_row(
                "SELECT id, token, dep_profile, created_at, updated_at FROM enrollment_profiles WHERE type = ?1",
                [enrollment_type.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let (id, token, dep_profile, created_at, updated_at) = row.ok_or_else(|| {
            AssignerError::NotFound(format!("{} enrollment profile", enrollment_type))
        })?;

        Ok(EnrollmentProfile {
            id: id as u32,
            token,
            enrollment_type,
            dep_profile,
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
        })
    }

    async fn new_enrollment_profile(
        &self,
        payload: EnrollmentProfilePayload,
    ) -> Result<EnrollmentProfile> {
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO enrollment_profiles (token, type, dep_profile, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                payload.token,
                payload.enrollment_type.as_str(),
                payload.dep_profile,
                format_time(now)
            ],
        )?;

        Ok(EnrollmentProfile {
            id: conn.last_insert_rowid() as u32,
            token: payload.token,
            enrollment_type: payload.enrollment_type,
            dep_profile: payload.dep_profile,
            created_at: now,
            updated_at: now,
        })
    }

    async fn setup_assistant(&self, scope: TeamScope) -> Result<SetupAssistant> {
        let conn = self.conn()?;
        Self::load_setup_assistant(&conn, scope)?
            .ok_or_else(|| AssignerError::NotFound(format!("setup assistant for {}", scope)))
    }

    async fn set_setup_assistant_profile_uuid(
        &self,
        scope: TeamScope,
        profile_uuid: &str,
    ) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE setup_assistants SET profile_uuid = ?2 WHERE team_key = ?1",
            params![scope.storage_key(), profile_uuid],
        )?;
        if updated == 0 {
            return Err(AssignerError::NotFound(format!(
                "setup assistant for {}",
                scope
            )));
        }
        Ok(())
    }

    async fn default_setup_assistant(
        &self,
        scope: TeamScope,
    ) -> Result<(String, DateTime<Utc>)> {
        let row: Option<(String, String)> = self
            .conn()?
            .query_row(
                "SELECT profile_uuid, updated_at FROM default_setup_assistants WHERE team_key = ?1",
                [scope.storage_key()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (profile_uuid, updated_at) = row.ok_or_else(|| {
            AssignerError::NotFound(format!("default setup assistant for {}", scope))
        })?;
        Ok((profile_uuid, parse_time(&updated_at)?))
    }

    async fn set_default_setup_assistant_profile_uuid(
        &self,
        scope: TeamScope,
        profile_uuid: &str,
    ) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO default_setup_assistants (team_key, profile_uuid, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(team_key) DO UPDATE SET profile_uuid = excluded.profile_uuid, updated_at = excluded.updated_at",
            params![scope.storage_key(), profile_uuid, now_str()],
        )?;
        Ok(())
    }

    async fn clear_profile_registrations(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let defaults = tx.execute("DELETE FROM default_setup_assistants", [])?;
        let custom = tx.execute(
            "UPDATE setup_assistants SET profile_uuid = '', uploaded_at = ?1",
            [now_str()],
        )?;
        tx.commit()?;

        tracing::info!(defaults, custom, "Cleared registered DEP profiles");
        Ok(())
    }

    async fn team(&self, id: u32) -> Result<Team> {
        let conn = self.conn()?;
        Self::load_team(
            &conn,
            "SELECT id, name, config FROM teams WHERE id = ?1",
            &i64::from(id),
        )?
        .ok_or_else(|| AssignerError::NotFound(format!("team {}", id)))
    }

    async fn team_by_name(&self, name: &str) -> Result<Team> {
        let conn = self.conn()?;
        Self::load_team(&conn, "SELECT id, name, config FROM teams WHERE name = ?1", &name)?
            .ok_or_else(|| AssignerError::NotFound(format!("team {:?}", name)))
    }

    async fn matching_host_serials(&self, serials: &[String]) -> Result<HashSet<String>> {
        if serials.is_empty() {
            return Ok(HashSet::new());
        }

        let conn = self.conn()?;
        let placeholders = vec!["?"; serials.len()].join(", ");
        let sql = format!(
            "SELECT hardware_serial FROM hosts WHERE hardware_serial IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(serials.iter()), |row| row.get(0))?
            .collect::<std::result::Result<HashSet<String>, _>>()?;
        Ok(found)
    }

    async fn delete_host_dep_assignments(&self, serials: &[String]) -> Result<()> {
        if serials.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let placeholders = vec!["?"; serials.len()].join(", ");
        let sql = format!(
            "DELETE FROM host_dep_assignments WHERE host_id IN (SELECT id FROM hosts WHERE hardware_serial IN ({}))",
            placeholders
        );
        let removed = conn.execute(&sql, params_from_iter(serials.iter()))?;
        tracing::debug!(serials = serials.len(), removed, "Deleted DEP assignments");
        Ok(())
    }

    async fn ingest_devices_from_dep_sync(
        &self,
        devices: &[Device],
    ) -> Result<(usize, Option<u32>)> {
        if devices.is_empty() {
            return Ok((0, None));
        }

        let mut conn = self.conn()?;
        let app_config = Self::load_app_config(&conn)?;

        let team_id = if app_config.mdm.apple_bm_default_team.is_empty() {
            None
        } else {
            let team = Self::load_team(
                &conn,
                "SELECT id, name, config FROM teams WHERE name = ?1",
                &app_config.mdm.apple_bm_default_team.as_str(),
            )?;
            if team.is_none() {
                tracing::warn!(
                    team = %app_config.mdm.apple_bm_default_team,
                    "DEP default team not found, ingesting into no team"
                );
            }
            team.map(|t| t.id)
        };

        let now = now_str();
        let tx = conn.transaction()?;
        let mut created = 0;
        for device in devices {
            created += tx.execute(
                "INSERT OR IGNORE INTO hosts (hardware_serial, hardware_model, platform, team_id, pending, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![
                    device.serial_number,
                    device.model,
                    device.platform(),
                    team_id.map(i64::from),
                    now
                ],
            )?;
            tx.execute(
                "INSERT INTO host_dep_assignments (host_id, profile_uuid, assigned_by, added_at)
                 SELECT id, ?2, ?3, ?4 FROM hosts WHERE hardware_serial = ?1
                 ON CONFLICT(host_id) DO UPDATE SET profile_uuid = excluded.profile_uuid, assigned_by = excluded.assigned_by",
                params![
                    device.serial_number,
                    device.profile_uuid,
                    device.device_assigned_by,
                    now
                ],
            )?;
        }
        tx.commit()?;

        Ok((created, team_id))
    }
}

#[async_trait]
impl CursorStorage for SqliteStore {
    async fn retrieve_cursor(&self, name: &str) -> Result<Cursor> {
        let row: Option<(String, String)> = self
            .conn()?
            .query_row(
                "SELECT cursor, updated_at FROM dep_cursors WHERE name = ?1",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((token, updated_at)) => Ok(Cursor {
                token,
                modified_at: Some(parse_time(&updated_at)?),
            }),
            None => Ok(Cursor::default()),
        }
    }

    async fn store_cursor(&self, name: &str, cursor: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO dep_cursors (name, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
            params![name, cursor, now_str()],
        )?;
        Ok(())
    }
}
