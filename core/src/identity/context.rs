use log::debug;

use super::{
    validate_user_name, ExtraFields, GroupRecord, IdentityError, IdentityStore, ShadowAging,
    UserDatabase, UserDefaults, UserRecord, GROUP_NO_PASSWORD, SHADOW_PASSWORD, USER_NO_PASSWORD,
};

/// Open handle on the identity database.
///
/// Every edit works on the in-memory copy read by [`DatabaseContext::open`]; nothing reaches the
/// store until [`DatabaseContext::store`] commits the whole database at once.
pub struct DatabaseContext<'a> {
    store: &'a dyn IdentityStore,
    defaults: UserDefaults,
    db: UserDatabase,
}

impl<'a> DatabaseContext<'a> {
    pub fn open(store: &'a dyn IdentityStore, defaults: UserDefaults) -> Result<Self, IdentityError> {
        let db = store.load()?;
        Ok(Self {
            store,
            defaults,
            db,
        })
    }

    /// Work on an already loaded copy of the store.
    pub fn with_database(
        store: &'a dyn IdentityStore,
        defaults: UserDefaults,
        db: UserDatabase,
    ) -> Self {
        Self {
            store,
            defaults,
            db,
        }
    }

    pub fn database(&self) -> &UserDatabase {
        &self.db
    }

    /// Add a user with freshly allocated ids and its mirror group.
    pub fn create_user(&mut self, name: &str) -> Result<UserRecord, IdentityError> {
        validate_user_name(name)?;
        if self.db.user(name).is_some() {
            return Err(IdentityError::UserExists(name.to_string()));
        }
        if self.db.group(name).is_some() {
            return Err(IdentityError::GroupExists(name.to_string()));
        }

        let uid = self.db.next_uid()?;
        let gid = self.db.next_gid()?;
        let user = UserRecord {
            name: name.to_string(),
            uid,
            gid,
            password: SHADOW_PASSWORD.into(),
            password_hash: Some(USER_NO_PASSWORD.into()),
            gecos: self.defaults.gecos.clone(),
            home: self.defaults.home_root.join(name).to_string_lossy().into_owned(),
            shell: self.defaults.shell.clone(),
            aging: ShadowAging::new_user(),
            extra: ExtraFields::default(),
        };
        let group = GroupRecord {
            name: name.to_string(),
            gid,
            password: SHADOW_PASSWORD.into(),
            password_hash: Some(GROUP_NO_PASSWORD.into()),
            members: vec![name.to_string()],
            admins: vec![name.to_string()],
            extra: ExtraFields::default(),
        };

        debug!("identity: created user {name} uid={uid} gid={gid}");
        self.db.push_user(user.clone());
        self.db.push_group(group);
        Ok(user)
    }

    pub fn delete_user(&mut self, name: &str) -> Result<UserRecord, IdentityError> {
        let user = self
            .db
            .remove_user(name)
            .ok_or_else(|| IdentityError::UnknownUser(name.to_string()))?;
        if self.db.remove_group(name).is_none() {
            debug!("identity: user {name} had no mirror group");
        }
        self.db.forget_member(name);
        Ok(user)
    }

    pub fn modify_user_password_hash(&mut self, name: &str, hash: &str) -> Result<(), IdentityError> {
        let user = self
            .db
            .user_mut(name)
            .ok_or_else(|| IdentityError::UnknownUser(name.to_string()))?;
        user.password = SHADOW_PASSWORD.into();
        user.password_hash = Some(hash.to_string());
        if let Some(group) = self.db.group_mut(name) {
            group.password = SHADOW_PASSWORD.into();
            group.password_hash = Some(hash.to_string());
        }
        Ok(())
    }

    pub fn delete_user_password_hash(&mut self, name: &str) -> Result<(), IdentityError> {
        let user = self
            .db
            .user_mut(name)
            .ok_or_else(|| IdentityError::UnknownUser(name.to_string()))?;
        user.password_hash = Some(USER_NO_PASSWORD.into());
        if let Some(group) = self.db.group_mut(name) {
            group.password_hash = Some(GROUP_NO_PASSWORD.into());
        }
        Ok(())
    }

    /// Commit the whole database in one call.
    pub fn store(&self) -> Result<(), IdentityError> {
        self.store.commit(&self.db)
    }
}
