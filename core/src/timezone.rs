//! System timezone, stored as a symlink from the localtime link into the zone database.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::adapter::{Adapter, Granularity};
use crate::change::{ChangeEvent, ChangeOperation};
use crate::errors::ReconcileError;
use crate::fsutil::staging_path;

const BACKEND: &str = "timezone";

#[derive(Debug, Error)]
pub enum TimezoneError {
    #[error("{} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("{} is not a symbolic link", .0.display())]
    NotALink(PathBuf),
    #[error("{} points outside the zone directory ({})", .link.display(), .target.display())]
    OutsideZoneDir { link: PathBuf, target: PathBuf },
    #[error("{0:?} is not a zone under the zone directory")]
    UnknownZone(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub struct TimezoneName {
    zone_dir: PathBuf,
    link: PathBuf,
}

impl TimezoneName {
    pub fn new(zone_dir: impl Into<PathBuf>, link: impl Into<PathBuf>) -> Self {
        Self {
            zone_dir: zone_dir.into(),
            link: link.into(),
        }
    }

    /// Zone name the link currently points at, relative to the zone directory.
    pub fn get_value(&self) -> Result<String, TimezoneError> {
        let meta = match fs::symlink_metadata(&self.link) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TimezoneError::Missing(self.link.clone()))
            }
            Err(err) => return Err(err.into()),
        };
        if !meta.file_type().is_symlink() {
            return Err(TimezoneError::NotALink(self.link.clone()));
        }

        let target = fs::read_link(&self.link)?;
        let absolute = match self.link.parent() {
            Some(parent) if target.is_relative() => parent.join(&target),
            _ => target.clone(),
        };
        normalize(&absolute)
            .strip_prefix(normalize(&self.zone_dir))
            .ok()
            .and_then(|rel| rel.to_str())
            .filter(|rel| !rel.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TimezoneError::OutsideZoneDir {
                link: self.link.clone(),
                target,
            })
    }

    /// `name` must be a plain relative path to a file inside the zone directory.
    pub fn check_name(&self, name: &str) -> Result<PathBuf, TimezoneError> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        let zone = self.zone_dir.join(relative);
        if plain && zone.is_file() {
            Ok(zone)
        } else {
            Err(TimezoneError::UnknownZone(name.to_string()))
        }
    }

    /// Point the link at `name`. The new link is staged next to the old one and renamed over it.
    pub fn set_value(&self, name: &str) -> Result<(), TimezoneError> {
        let zone = self.check_name(name)?;
        let staged = staging_path(&self.link);
        symlink(&zone, &staged)?;
        if let Err(err) = fs::rename(&staged, &self.link) {
            let _ = fs::remove_file(&staged);
            return Err(err.into());
        }
        Ok(())
    }
}

fn invalid(err: TimezoneError) -> ReconcileError {
    ReconcileError::invalid(err.to_string())
}

/// Adapter for `clock/timezone-name`.
pub struct TimezoneAdapter {
    tz: TimezoneName,
    current: Option<String>,
    desired: Option<String>,
}

impl TimezoneAdapter {
    pub fn new(tz: TimezoneName) -> Self {
        Self {
            tz,
            current: None,
            desired: None,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

impl Adapter for TimezoneAdapter {
    fn name(&self) -> &'static str {
        "timezone"
    }

    fn granularity(&self) -> Granularity {
        Granularity::WholeCollection
    }

    /// A missing link is an unset zone; anything else unreadable fails the load.
    fn load(&mut self) -> Result<(), ReconcileError> {
        self.desired = None;
        self.current = match self.tz.get_value() {
            Ok(name) => Some(name),
            Err(TimezoneError::Missing(_)) => None,
            Err(err) => return Err(ReconcileError::load(BACKEND, err)),
        };
        Ok(())
    }

    fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        let path = event.node_path()?;
        if path.leaf_name() != "timezone-name" {
            debug!("timezone: ignoring {}", event.path);
            return Ok(());
        }
        match event.operation {
            ChangeOperation::Create | ChangeOperation::Modify => {
                let name = event.required_value()?.trim();
                self.tz.check_name(name).map_err(invalid)?;
                self.desired = Some(name.to_string());
            }
            ChangeOperation::Delete => {
                self.desired = None;
                debug!("timezone: delete leaves the current link in place");
            }
            ChangeOperation::Move => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        match &self.desired {
            Some(name) => self.tz.check_name(name).map(|_| ()).map_err(invalid),
            None => Ok(()),
        }
    }

    fn store(&mut self) -> Result<(), ReconcileError> {
        let Some(name) = self.desired.clone() else {
            return Ok(());
        };
        if self.current.as_deref() == Some(name.as_str()) {
            return Ok(());
        }
        self.tz.set_value(&name).map_err(|err| match err {
            TimezoneError::UnknownZone(_) => invalid(err),
            other => ReconcileError::store(BACKEND, other),
        })?;
        info!("timezone set to {name}");
        self.current = Some(name);
        Ok(())
    }
}
