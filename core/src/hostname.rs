use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, info};

use crate::adapter::{Adapter, Granularity};
use crate::change::{ChangeEvent, ChangeOperation};
use crate::errors::ReconcileError;
use crate::fsutil::replace_file;

const BACKEND: &str = "hostname";

/// RFC 1123 host name: dot separated labels of letters, digits and inner hyphens.
pub fn check_hostname(name: &str) -> Result<(), ReconcileError> {
    let label_ok = |label: &str| {
        (1..=63).contains(&label.len())
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if name.len() <= 253 && name.split('.').all(label_ok) {
        Ok(())
    } else {
        Err(ReconcileError::invalid(format!("{name:?} is not a valid host name")))
    }
}

/// Static host name kept in a one-line file such as `/etc/hostname`.
pub struct HostnameAdapter {
    path: PathBuf,
    current: Option<String>,
    desired: Option<String>,
}

impl HostnameAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
            desired: None,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

impl Adapter for HostnameAdapter {
    fn name(&self) -> &'static str {
        "hostname"
    }

    fn granularity(&self) -> Granularity {
        Granularity::WholeCollection
    }

    fn load(&mut self) -> Result<(), ReconcileError> {
        self.desired = None;
        self.current = match fs::read_to_string(&self.path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(ReconcileError::load(BACKEND, err)),
        };
        Ok(())
    }

    fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        match event.operation {
            ChangeOperation::Create | ChangeOperation::Modify => {
                let name = event.required_value()?.trim();
                check_hostname(name)?;
                self.desired = Some(name.to_string());
            }
            ChangeOperation::Delete => {
                self.desired = None;
                debug!("hostname: delete keeps {:?}", self.current);
            }
            ChangeOperation::Move => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        self.desired.as_deref().map_or(Ok(()), check_hostname)
    }

    fn store(&mut self) -> Result<(), ReconcileError> {
        let Some(name) = self.desired.clone() else {
            return Ok(());
        };
        if self.current.as_deref() == Some(name.as_str()) {
            return Ok(());
        }
        replace_file(&self.path, &format!("{name}\n"))
            .map_err(|err| ReconcileError::store(BACKEND, err))?;
        info!("hostname set to {name}");
        self.current = Some(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOSTNAME: &str = "/ietf-system:system/hostname";

    #[test]
    fn accepts_rfc1123_names() {
        for ok in ["router", "edge-01", "a.b.example", "9lives"] {
            assert!(check_hostname(ok).is_ok(), "{ok}");
        }
        let long = "x".repeat(64);
        for bad in ["", "-lead", "trail-", "under_score", "a..b", long.as_str()] {
            assert!(check_hostname(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn store_writes_only_on_change() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hostname");
        fs::write(&path, "# managed\nold-name\n").unwrap();

        let mut adapter = HostnameAdapter::new(&path);
        adapter.load().unwrap();
        assert_eq!(adapter.current(), Some("old-name"));

        adapter.store().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# managed\nold-name\n");

        adapter
            .apply(&ChangeEvent::modify(HOSTNAME, "new-name"))
            .unwrap();
        adapter.store().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new-name\n");
    }

    #[test]
    fn invalid_name_is_rejected_and_delete_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hostname");
        let mut adapter = HostnameAdapter::new(&path);
        adapter.load().unwrap();
        assert_eq!(adapter.current(), None);

        let err = adapter
            .apply(&ChangeEvent::modify(HOSTNAME, "bad_name"))
            .unwrap_err();
        assert_eq!(err.code(), "VAL-1001");
        adapter.apply(&ChangeEvent::delete(HOSTNAME)).unwrap();
        adapter.store().unwrap();
        assert!(!path.exists());
    }
}
