use std::fs;
use std::io;
use std::os::unix::fs::{chown, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use super::{
    usable_hash, validate_user_name, DatabaseContext, IdentityError, IdentityStore, UserDatabase,
    UserDefaults, UserRecord,
};
use crate::adapter::{Adapter, Granularity};
use crate::change::{ChangeEvent, ChangeOperation};
use crate::errors::ReconcileError;

const BACKEND: &str = "identity";

/// A managed account as seen by configuration: name and usable password hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub name: String,
    pub password_hash: Option<String>,
}

fn managed_users(db: &UserDatabase) -> Vec<LocalUser> {
    db.users()
        .iter()
        .filter(|u| u.is_managed())
        .map(|u| LocalUser {
            name: u.name.clone(),
            password_hash: usable_hash(u.password_hash.as_deref()).map(str::to_string),
        })
        .collect()
}

fn check_hash(name: &str, hash: &str) -> Result<(), ReconcileError> {
    if hash.starts_with("$0$") {
        return Err(ReconcileError::invalid(format!(
            "user {name}: clear-text passwords are not accepted, supply a crypt hash"
        )));
    }
    if hash.contains([':', '\n']) {
        return Err(ReconcileError::invalid(format!(
            "user {name}: password hash contains a field separator"
        )));
    }
    Ok(())
}

fn into_reconcile(err: IdentityError) -> ReconcileError {
    match err {
        IdentityError::UserExists(_)
        | IdentityError::GroupExists(_)
        | IdentityError::InvalidName(_)
        | IdentityError::IdsExhausted(_) => ReconcileError::invalid(err.to_string()),
        other => ReconcileError::store(BACKEND, other),
    }
}

/// Creates home directories for new accounts from a skeleton directory.
#[derive(Debug, Clone)]
pub struct HomeProvisioner {
    skel_dir: PathBuf,
    set_owner: bool,
}

impl HomeProvisioner {
    pub fn new(skel_dir: impl Into<PathBuf>) -> Self {
        Self {
            skel_dir: skel_dir.into(),
            set_owner: true,
        }
    }

    /// Leave ownership with the calling process (unprivileged runs).
    pub fn without_ownership(mut self) -> Self {
        self.set_owner = false;
        self
    }

    /// Returns false when the home directory already existed.
    pub fn provision(&self, user: &UserRecord) -> io::Result<bool> {
        let home = Path::new(&user.home);
        if home.exists() {
            return Ok(false);
        }
        fs::create_dir_all(home)?;
        fs::set_permissions(home, fs::Permissions::from_mode(0o700))?;

        if self.skel_dir.is_dir() {
            for entry in fs::read_dir(&self.skel_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let target = home.join(entry.file_name());
                fs::copy(entry.path(), &target)?;
                if self.set_owner {
                    chown(&target, Some(user.uid), Some(user.gid))?;
                }
            }
        }
        if self.set_owner {
            chown(home, Some(user.uid), Some(user.gid))?;
        }
        Ok(true)
    }
}

/// Declarative list of managed local users.
///
/// Edits only touch the in-memory list. `validate` replays the resulting delta against the
/// database read by `load`; `store` reopens the database, replays it again and commits once.
pub struct LocalUserList<'a> {
    store: &'a dyn IdentityStore,
    defaults: UserDefaults,
    provisioner: Option<HomeProvisioner>,
    loaded: UserDatabase,
    users: Vec<LocalUser>,
}

/// What replaying the list against a database changed.
struct Delta {
    changes: usize,
    created: Vec<UserRecord>,
}

impl<'a> LocalUserList<'a> {
    pub fn new(store: &'a dyn IdentityStore, defaults: UserDefaults) -> Self {
        Self {
            store,
            defaults,
            provisioner: None,
            loaded: UserDatabase::default(),
            users: Vec::new(),
        }
    }

    pub fn with_provisioner(mut self, provisioner: HomeProvisioner) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn users(&self) -> &[LocalUser] {
        &self.users
    }

    fn upsert(&mut self, name: &str) -> &mut LocalUser {
        match self.users.iter().position(|u| u.name == name) {
            Some(idx) => &mut self.users[idx],
            None => {
                self.users.push(LocalUser {
                    name: name.to_string(),
                    password_hash: None,
                });
                let last = self.users.len() - 1;
                &mut self.users[last]
            }
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.name != name);
        before != self.users.len()
    }

    /// Turn `ctx` into the database described by the list.
    fn replay(&self, ctx: &mut DatabaseContext<'_>) -> Result<Delta, ReconcileError> {
        let baseline = managed_users(ctx.database());
        let mut delta = Delta {
            changes: 0,
            created: Vec::new(),
        };

        for old in &baseline {
            if !self.users.iter().any(|u| u.name == old.name) {
                if old.name == "root" {
                    return Err(ReconcileError::invalid("the root account cannot be deleted"));
                }
                ctx.delete_user(&old.name).map_err(into_reconcile)?;
                debug!("identity: removing user {}", old.name);
                delta.changes += 1;
            }
        }

        for user in &self.users {
            let previous = baseline.iter().find(|b| b.name == user.name);
            if previous.is_none() {
                delta
                    .created
                    .push(ctx.create_user(&user.name).map_err(into_reconcile)?);
                delta.changes += 1;
            }
            if previous.map(|p| &p.password_hash) == Some(&user.password_hash) {
                continue;
            }
            let updated = match &user.password_hash {
                Some(hash) => ctx.modify_user_password_hash(&user.name, hash),
                None if previous.is_some() => ctx.delete_user_password_hash(&user.name),
                None => continue,
            };
            updated.map_err(into_reconcile)?;
            delta.changes += 1;
        }
        Ok(delta)
    }
}

impl Adapter for LocalUserList<'_> {
    fn name(&self) -> &'static str {
        "local-users"
    }

    fn granularity(&self) -> Granularity {
        Granularity::PerItem
    }

    fn load(&mut self) -> Result<(), ReconcileError> {
        let db = self
            .store
            .load()
            .map_err(|err| ReconcileError::load(BACKEND, err))?;
        self.users = managed_users(&db);
        self.loaded = db;
        Ok(())
    }

    fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        if event.operation == ChangeOperation::Move {
            return Ok(());
        }
        let path = event.node_path()?;
        let below = path.below("user");
        if below.first() == Some(&"authorized-key") {
            return Ok(());
        }
        let name = path
            .list_key("user", "name")
            .ok_or_else(|| ReconcileError::key(&event.path))?
            .to_string();
        validate_user_name(&name).map_err(|err| ReconcileError::invalid(err.to_string()))?;

        match event.operation {
            ChangeOperation::Create | ChangeOperation::Modify => match below.last().copied() {
                None | Some("name") => {
                    self.upsert(&name);
                }
                Some("password") => {
                    let hash = event.required_value()?;
                    check_hash(&name, hash)?;
                    self.upsert(&name).password_hash = usable_hash(Some(hash)).map(str::to_string);
                }
                Some(other) => {
                    self.upsert(&name);
                    debug!("user {name}: ignoring leaf {other}");
                }
            },
            ChangeOperation::Delete => match below.last().copied() {
                None => {
                    if name == "root" {
                        return Err(ReconcileError::invalid("the root account cannot be deleted"));
                    }
                    if !self.remove(&name) {
                        debug!("user {name} already absent");
                    }
                }
                Some("password") => {
                    if let Some(user) = self.users.iter_mut().find(|u| u.name == name) {
                        user.password_hash = None;
                    }
                }
                Some(_) => {}
            },
            ChangeOperation::Move => {}
        }
        Ok(())
    }

    /// Dry run of `store` against the loaded database: name clashes with system accounts or
    /// groups, root removal and id exhaustion all fail here.
    fn validate(&self) -> Result<(), ReconcileError> {
        let mut scratch =
            DatabaseContext::with_database(self.store, self.defaults.clone(), self.loaded.clone());
        self.replay(&mut scratch).map(|_| ())
    }

    fn store(&mut self) -> Result<(), ReconcileError> {
        let mut ctx = DatabaseContext::open(self.store, self.defaults.clone())
            .map_err(|err| ReconcileError::store(BACKEND, err))?;
        let Delta { changes, created } = self.replay(&mut ctx)?;

        if changes == 0 {
            debug!("identity: no changes to commit");
            return Ok(());
        }
        ctx.store()
            .map_err(|err| ReconcileError::store(BACKEND, err))?;
        info!("identity: committed {changes} change(s)");
        for user in &created {
            info!("identity: added user {} uid={}", user.name, user.uid);
        }

        if let Some(provisioner) = &self.provisioner {
            for user in &created {
                match provisioner.provision(user) {
                    Ok(true) => debug!("identity: provisioned home {}", user.home),
                    Ok(false) => debug!("identity: home {} already exists", user.home),
                    Err(err) => {
                        error!(
                            "identity: user {} committed but home {} could not be created: {err}",
                            user.name, user.home
                        );
                        return Err(ReconcileError::store(BACKEND, err));
                    }
                }
            }
        }
        Ok(())
    }
}
