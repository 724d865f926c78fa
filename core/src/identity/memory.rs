use std::sync::Mutex;

use super::{IdentityError, IdentityStore, UserDatabase};

/// Identity store kept in process memory; counts commits and can be told to fail.
#[derive(Default)]
pub struct MemoryIdentityStore {
    db: Mutex<UserDatabase>,
    commits: Mutex<usize>,
    fail_load: Mutex<Option<String>>,
    fail_commit: Mutex<Option<String>>,
}

impl MemoryIdentityStore {
    pub fn new(db: UserDatabase) -> Self {
        Self {
            db: Mutex::new(db),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> UserDatabase {
        self.db.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn commits(&self) -> usize {
        *self.commits.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_loads(&self, reason: Option<&str>) {
        *self.fail_load.lock().unwrap_or_else(|e| e.into_inner()) = reason.map(str::to_string);
    }

    pub fn fail_commits(&self, reason: Option<&str>) {
        *self.fail_commit.lock().unwrap_or_else(|e| e.into_inner()) = reason.map(str::to_string);
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<UserDatabase, IdentityError> {
        if let Some(reason) = self.fail_load.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(IdentityError::Unavailable(reason));
        }
        Ok(self.snapshot())
    }

    fn commit(&self, db: &UserDatabase) -> Result<(), IdentityError> {
        if let Some(reason) = self.fail_commit.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(IdentityError::Unavailable(reason));
        }
        *self.db.lock().unwrap_or_else(|e| e.into_inner()) = db.clone();
        *self.commits.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
