//! Local identity database: users, their mirror groups, password hashes and authorized keys.
//!
//! The database is loaded as a whole into a [`UserDatabase`], edited in memory through a
//! [`DatabaseContext`] and written back with a single commit through an [`IdentityStore`].

pub mod context;
pub mod files;
pub mod keys;
pub mod memory;
pub mod sqlite;
pub mod users;

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

pub use context::DatabaseContext;
pub use files::FlatFileIdentityStore;
pub use keys::{AuthorizedKey, AuthorizedKeyList, AuthorizedKeysAdapter};
pub use memory::MemoryIdentityStore;
pub use sqlite::SqliteIdentityStore;
pub use users::{HomeProvisioner, LocalUser, LocalUserList};

/// First id handed out to regular users and groups.
pub const ID_MIN: u32 = 1000;
/// Reserved for `nobody`; never allocated.
pub const ID_LIMIT: u32 = 65534;

/// Password field value meaning "look in the shadow file".
pub const SHADOW_PASSWORD: &str = "x";
/// Sentinel hash of a user without a usable password.
pub const USER_NO_PASSWORD: &str = "*";
/// Sentinel hash of a group without a usable password.
pub const GROUP_NO_PASSWORD: &str = "!";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity database unavailable: {0}")]
    Unavailable(String),
    #[error("identity database is corrupt: {0}")]
    Corrupt(String),
    #[error("user {0} already exists")]
    UserExists(String),
    #[error("group {0} already exists")]
    GroupExists(String),
    #[error("user {0} does not exist")]
    UnknownUser(String),
    #[error("no free id left below {0}")]
    IdsExhausted(u32),
    #[error("invalid user name {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
}

/// Shadow password aging fields; `None` is an empty field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowAging {
    pub last_change: Option<i64>,
    pub change_min: Option<i64>,
    pub change_max: Option<i64>,
    pub warn_days: Option<i64>,
    pub inactive_days: Option<i64>,
    pub expiration: Option<i64>,
}

impl ShadowAging {
    /// Aging applied to freshly created users.
    pub fn new_user() -> Self {
        Self {
            last_change: None,
            change_min: Some(0),
            change_max: Some(99999),
            warn_days: Some(7),
            inactive_days: None,
            expiration: None,
        }
    }
}

/// Fields past the standard ones on a flat-file line, written back verbatim.
/// Other stores leave them empty.
///
/// `shadow` is `None` when the record has no shadow line yet; such records are written in the
/// standard layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraFields {
    pub primary: Vec<String>,
    pub shadow: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub password: String,
    pub password_hash: Option<String>,
    pub gecos: String,
    pub home: String,
    pub shell: String,
    pub aging: ShadowAging,
    pub extra: ExtraFields,
}

impl UserRecord {
    /// Users whose configuration is reconciled: root and regular accounts.
    pub fn is_managed(&self) -> bool {
        self.uid == 0 || (ID_MIN..ID_LIMIT).contains(&self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub name: String,
    pub gid: u32,
    pub password: String,
    pub password_hash: Option<String>,
    pub members: Vec<String>,
    pub admins: Vec<String>,
    pub extra: ExtraFields,
}

/// Defaults stamped onto users created by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDefaults {
    pub shell: String,
    pub gecos: String,
    pub home_root: PathBuf,
}

impl Default for UserDefaults {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".into(),
            gecos: String::new(),
            home_root: PathBuf::from("/home"),
        }
    }
}

/// Whole user/group store held in memory, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDatabase {
    users: Vec<UserRecord>,
    groups: Vec<GroupRecord>,
}

impl UserDatabase {
    pub fn new(users: Vec<UserRecord>, groups: Vec<GroupRecord>) -> Self {
        Self { users, groups }
    }

    pub fn users(&self) -> &[UserRecord] {
        &self.users
    }

    pub fn groups(&self) -> &[GroupRecord] {
        &self.groups
    }

    pub fn user(&self, name: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.name == name)
    }

    pub fn user_mut(&mut self, name: &str) -> Option<&mut UserRecord> {
        self.users.iter_mut().find(|u| u.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&GroupRecord> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut GroupRecord> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    pub fn push_user(&mut self, user: UserRecord) {
        self.users.push(user);
    }

    pub fn push_group(&mut self, group: GroupRecord) {
        self.groups.push(group);
    }

    pub fn remove_user(&mut self, name: &str) -> Option<UserRecord> {
        let idx = self.users.iter().position(|u| u.name == name)?;
        Some(self.users.remove(idx))
    }

    pub fn remove_group(&mut self, name: &str) -> Option<GroupRecord> {
        let idx = self.groups.iter().position(|g| g.name == name)?;
        Some(self.groups.remove(idx))
    }

    /// Drop `name` from every group's member and admin lists.
    pub fn forget_member(&mut self, name: &str) {
        for group in &mut self.groups {
            group.members.retain(|m| m != name);
            group.admins.retain(|m| m != name);
        }
    }

    pub fn next_uid(&self) -> Result<u32, IdentityError> {
        next_free_id(self.users.iter().map(|u| u.uid))
    }

    pub fn next_gid(&self) -> Result<u32, IdentityError> {
        next_free_id(
            self.groups
                .iter()
                .map(|g| g.gid)
                .chain(self.users.iter().map(|u| u.gid)),
        )
    }
}

/// One past the highest regular id in use, wrapping to the lowest free id once the top of the
/// range is taken.
fn next_free_id(used: impl Iterator<Item = u32>) -> Result<u32, IdentityError> {
    let used: BTreeSet<u32> = used.collect();
    let start = used
        .range(ID_MIN..ID_LIMIT)
        .next_back()
        .map_or(ID_MIN, |max| max + 1);
    (start..ID_LIMIT)
        .chain(ID_MIN..start)
        .find(|id| !used.contains(id))
        .ok_or(IdentityError::IdsExhausted(ID_LIMIT))
}

/// Persistent backend of the identity database.
pub trait IdentityStore {
    /// Read the whole store.
    fn load(&self) -> Result<UserDatabase, IdentityError>;

    /// Replace the whole store with `db` in one step.
    fn commit(&self, db: &UserDatabase) -> Result<(), IdentityError>;
}

/// `name` must be usable as a passwd entry and as a path component.
pub fn validate_user_name(name: &str) -> Result<(), IdentityError> {
    let valid = !name.is_empty()
        && name.len() <= 32
        && !name.starts_with('-')
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$'));
    if valid {
        Ok(())
    } else {
        Err(IdentityError::InvalidName(name.to_string()))
    }
}

/// A stored hash that stands for a real credential.
pub fn usable_hash(hash: Option<&str>) -> Option<&str> {
    hash.filter(|h| !h.is_empty() && *h != USER_NO_PASSWORD && *h != GROUP_NO_PASSWORD)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn first_regular_id_is_the_range_start() {
        let db = base_database();
        assert_eq!(db.next_uid().unwrap(), ID_MIN);
        assert_eq!(db.next_gid().unwrap(), ID_MIN);
    }

    #[test]
    fn allocation_skips_ids_in_use() {
        let mut db = base_database();
        db.push_user(user("a", 1000));
        db.push_user(user("b", 1004));
        db.push_group(group("c", 1007, &[]));
        assert_eq!(db.next_uid().unwrap(), 1005);
        assert_eq!(db.next_gid().unwrap(), 1008);
    }

    #[test]
    fn allocation_wraps_to_lowest_gap_at_the_top() {
        let mut db = base_database();
        db.push_user(user("low", 1000));
        db.push_user(user("top", ID_LIMIT - 1));
        assert_eq!(db.next_uid().unwrap(), 1001);
    }

    #[test]
    fn managed_users_are_root_and_regular_accounts() {
        assert!(user("root", 0).is_managed());
        assert!(!user("daemon", 1).is_managed());
        assert!(user("alice", 1000).is_managed());
        assert!(!user("nobody", ID_LIMIT).is_managed());
    }

    #[test]
    fn sentinels_are_not_usable_hashes() {
        assert_eq!(usable_hash(Some("*")), None);
        assert_eq!(usable_hash(Some("!")), None);
        assert_eq!(usable_hash(Some("")), None);
        assert_eq!(usable_hash(Some("$6$salt$hash")), Some("$6$salt$hash"));
    }

    #[test]
    fn user_names_are_validated() {
        assert!(validate_user_name("alice").is_ok());
        assert!(validate_user_name("svc-backup_1").is_ok());
        assert!(validate_user_name("").is_err());
        assert!(validate_user_name("-rf").is_err());
        assert!(validate_user_name("a:b").is_err());
        assert!(validate_user_name("..").is_err());
        assert!(validate_user_name("a/b").is_err());
    }
}
