use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::identity::UserDefaults;
use crate::logging::log_event;

const SETTINGS_KEY: &str = "system.settings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBackend {
    /// passwd/shadow/group/gshadow under `identity_dir`.
    Files,
    /// `identity_*` tables of the service database.
    Sqlite,
}

/// Filesystem locations and defaults used by the reconciliation backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub zoneinfo_dir: PathBuf,
    pub localtime_link: PathBuf,
    pub hostname_file: PathBuf,
    pub identity_backend: IdentityBackend,
    pub identity_dir: PathBuf,
    pub home_root: PathBuf,
    pub root_home: PathBuf,
    pub skel_dir: PathBuf,
    pub provision_home: bool,
    pub default_shell: String,
    pub default_gecos: String,
    pub resolver_ifindex: i32,
    pub resolver_endpoint: Option<String>,
    pub resolver_timeout_secs: u64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            zoneinfo_dir: PathBuf::from("/usr/share/zoneinfo"),
            localtime_link: PathBuf::from("/etc/localtime"),
            hostname_file: PathBuf::from("/etc/hostname"),
            identity_backend: IdentityBackend::Files,
            identity_dir: PathBuf::from("/etc"),
            home_root: PathBuf::from("/home"),
            root_home: PathBuf::from("/root"),
            skel_dir: PathBuf::from("/etc/skel"),
            provision_home: false,
            default_shell: "/bin/bash".into(),
            default_gecos: String::new(),
            resolver_ifindex: 0,
            resolver_endpoint: None,
            resolver_timeout_secs: 30,
        }
    }
}

impl SystemSettings {
    pub fn user_defaults(&self) -> UserDefaults {
        UserDefaults {
            shell: self.default_shell.clone(),
            gecos: self.default_gecos.clone(),
            home_root: self.home_root.clone(),
        }
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let paths = [
            ("zoneinfo_dir", &self.zoneinfo_dir),
            ("localtime_link", &self.localtime_link),
            ("hostname_file", &self.hostname_file),
            ("identity_dir", &self.identity_dir),
            ("home_root", &self.home_root),
            ("root_home", &self.root_home),
            ("skel_dir", &self.skel_dir),
        ];
        for (field, path) in paths {
            if !path.is_absolute() {
                bail!("{field} must be an absolute path, got {}", path.display());
            }
        }
        if !self.default_shell.starts_with('/') {
            bail!("default_shell must be an absolute path");
        }
        if self.default_gecos.contains([':', '\n']) {
            bail!("default_gecos must not contain ':' or newlines");
        }
        if self.resolver_ifindex < 0 {
            bail!("resolver_ifindex must not be negative");
        }
        if self.resolver_timeout_secs == 0 {
            bail!("resolver_timeout_secs must be positive");
        }
        Ok(())
    }
}

pub fn seed_defaults(conn: &rusqlite::Connection) -> Result<()> {
    let payload = serde_json::to_string(&SystemSettings::default())?;
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO NOTHING",
        params![SETTINGS_KEY, payload, OffsetDateTime::now_utc().unix_timestamp()],
    )?;
    Ok(())
}

pub fn get_settings(conn: &rusqlite::Connection) -> Result<SystemSettings> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![SETTINGS_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(raw) => serde_json::from_str(&raw).context("stored system settings are malformed"),
        None => Ok(SystemSettings::default()),
    }
}

pub fn update_settings(
    conn: &rusqlite::Connection,
    settings: SystemSettings,
) -> Result<SystemSettings> {
    settings.validate()?;
    let payload = serde_json::to_string(&settings)?;
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![SETTINGS_KEY, payload, OffsetDateTime::now_utc().unix_timestamp()],
    )?;
    audit_settings_change(conn, "system settings updated");
    get_settings(conn)
}

pub fn audit_settings_change(conn: &rusqlite::Connection, message: &str) {
    let _ = log_event(
        conn,
        "info",
        Some("CFG-0001"),
        "config.settings",
        message,
        Some("Reconciliation backend settings changed"),
        None,
    );
}
