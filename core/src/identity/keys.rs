use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD as B64_ENGINE, STANDARD_NO_PAD};
use base64::Engine;
use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::adapter::{Adapter, Granularity};
use crate::change::{ChangeEvent, ChangeOperation};
use crate::errors::ReconcileError;

const BACKEND: &str = "authorized-keys";
const KEY_SUFFIX: &str = "pub";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizedKey {
    pub name: String,
    pub algorithm: String,
    pub key_data: String,
    /// Free text after the key data, kept as found on disk.
    pub comment: Option<String>,
}

impl AuthorizedKey {
    /// OpenSSH style `SHA256:<digest>` of the decoded key blob.
    pub fn fingerprint(&self) -> Result<String, ReconcileError> {
        let blob = decode_key_data(&self.name, &self.key_data)?;
        let digest = Sha256::digest(&blob);
        Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
    }

    fn file_contents(&self) -> String {
        match &self.comment {
            Some(comment) => format!("{} {} {comment}\n", self.algorithm, self.key_data),
            None => format!("{} {}\n", self.algorithm, self.key_data),
        }
    }
}

/// Next whitespace separated field and the rest of the line.
fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some(s.split_at(end))
}

/// `<algorithm> <key-data> [comment]` from the first key line of a `.pub` file.
fn parse_key_file(name: &str, contents: &str) -> Option<AuthorizedKey> {
    let line = contents
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))?;
    let (algorithm, rest) = next_field(line)?;
    let (key_data, rest) = next_field(rest)?;
    let comment = rest.trim();
    Some(AuthorizedKey {
        name: name.to_string(),
        algorithm: algorithm.to_string(),
        key_data: key_data.to_string(),
        comment: (!comment.is_empty()).then(|| comment.to_string()),
    })
}

fn decode_key_data(name: &str, data: &str) -> Result<Vec<u8>, ReconcileError> {
    B64_ENGINE
        .decode(data.trim())
        .map_err(|err| ReconcileError::invalid(format!("key {name}: key data is not base64: {err}")))
}

fn check_key_name(name: &str) -> Result<(), ReconcileError> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\0']) {
        return Err(ReconcileError::invalid(format!(
            "{name:?} cannot be used as a key file name"
        )));
    }
    Ok(())
}

/// The authorized keys of one user, one `<name>.pub` file per key.
#[derive(Debug, Clone)]
pub struct AuthorizedKeyList {
    user: String,
    dir: PathBuf,
    keys: Vec<AuthorizedKey>,
    on_disk: Vec<AuthorizedKey>,
}

impl AuthorizedKeyList {
    pub fn new(user: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            dir: dir.into(),
            keys: Vec::new(),
            on_disk: Vec::new(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keys(&self) -> &[AuthorizedKey] {
        &self.keys
    }

    /// Read every `*.pub` file; a missing directory is an empty list.
    pub fn load(&mut self) -> Result<(), ReconcileError> {
        self.keys.clear();
        self.on_disk.clear();
        if !self.dir.exists() {
            return Ok(());
        }
        let entries = fs::read_dir(&self.dir).map_err(|err| ReconcileError::load(BACKEND, err))?;
        for entry in entries {
            let path = entry.map_err(|err| ReconcileError::load(BACKEND, err))?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(KEY_SUFFIX) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let contents =
                fs::read_to_string(&path).map_err(|err| ReconcileError::load(BACKEND, err))?;
            let key = parse_key_file(name, &contents).ok_or_else(|| {
                ReconcileError::load(
                    BACKEND,
                    format!("{} is not an `<algorithm> <key-data>` file", path.display()),
                )
            })?;
            self.keys.push(key);
        }
        self.keys.sort_by(|a, b| a.name.cmp(&b.name));
        self.on_disk = self.keys.clone();
        Ok(())
    }

    pub fn upsert(&mut self, name: &str) -> &mut AuthorizedKey {
        match self.keys.iter().position(|k| k.name == name) {
            Some(idx) => &mut self.keys[idx],
            None => {
                self.keys.push(AuthorizedKey {
                    name: name.to_string(),
                    ..AuthorizedKey::default()
                });
                let last = self.keys.len() - 1;
                &mut self.keys[last]
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| k.name != name);
        before != self.keys.len()
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        for key in &self.keys {
            if key.algorithm.is_empty() || key.key_data.is_empty() {
                return Err(ReconcileError::invalid(format!(
                    "user {}: key {} needs both an algorithm and key data",
                    self.user, key.name
                )));
            }
            decode_key_data(&key.name, &key.key_data)?;
        }
        Ok(())
    }

    /// Write the keys that differ from what `load` read and drop `.pub` files of keys no longer
    /// listed. Untouched files are left byte for byte.
    pub fn store(&self) -> Result<(), ReconcileError> {
        self.validate()?;
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|err| ReconcileError::store(BACKEND, err))?;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                .map_err(|err| ReconcileError::store(BACKEND, err))?;
        }

        for key in &self.keys {
            if self.on_disk.contains(key) {
                continue;
            }
            let path = self.dir.join(format!("{}.{KEY_SUFFIX}", key.name));
            let contents = key.file_contents();
            if fs::read_to_string(&path).ok().as_deref() == Some(contents.as_str()) {
                continue;
            }
            fs::write(&path, contents).map_err(|err| ReconcileError::store(BACKEND, err))?;
            match key.fingerprint() {
                Ok(fp) => info!("user {}: installed key {} ({fp})", self.user, key.name),
                Err(_) => info!("user {}: installed key {}", self.user, key.name),
            }
        }

        let entries = fs::read_dir(&self.dir).map_err(|err| ReconcileError::store(BACKEND, err))?;
        for entry in entries {
            let path = entry.map_err(|err| ReconcileError::store(BACKEND, err))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_SUFFIX) {
                continue;
            }
            let stale = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map_or(false, |stem| !self.keys.iter().any(|k| k.name == stem));
            if stale && path.is_file() {
                fs::remove_file(&path).map_err(|err| ReconcileError::store(BACKEND, err))?;
                info!("user {}: removed key file {}", self.user, path.display());
            }
        }
        Ok(())
    }
}

/// Reconciles `user[name]/authorized-key[name]` entries, one key list per user touched.
pub struct AuthorizedKeysAdapter {
    home_root: PathBuf,
    root_home: PathBuf,
    lists: Vec<AuthorizedKeyList>,
}

impl AuthorizedKeysAdapter {
    pub fn new(home_root: impl Into<PathBuf>, root_home: impl Into<PathBuf>) -> Self {
        Self {
            home_root: home_root.into(),
            root_home: root_home.into(),
            lists: Vec::new(),
        }
    }

    pub fn ssh_dir(&self, user: &str) -> PathBuf {
        if user == "root" {
            self.root_home.join(".ssh")
        } else {
            self.home_root.join(user).join(".ssh")
        }
    }

    pub fn lists(&self) -> &[AuthorizedKeyList] {
        &self.lists
    }

    fn list_for(&mut self, user: &str) -> Result<&mut AuthorizedKeyList, ReconcileError> {
        if let Some(idx) = self.lists.iter().position(|l| l.user == user) {
            return Ok(&mut self.lists[idx]);
        }
        let mut list = AuthorizedKeyList::new(user, self.ssh_dir(user));
        list.load()?;
        debug!("user {user}: {} authorized keys on disk", list.keys.len());
        self.lists.push(list);
        let last = self.lists.len() - 1;
        Ok(&mut self.lists[last])
    }
}

impl Adapter for AuthorizedKeysAdapter {
    fn name(&self) -> &'static str {
        "authorized-keys"
    }

    fn granularity(&self) -> Granularity {
        Granularity::PerItem
    }

    /// Key directories are read lazily, per user, as events name them.
    fn load(&mut self) -> Result<(), ReconcileError> {
        self.lists.clear();
        Ok(())
    }

    fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        if event.operation == ChangeOperation::Move {
            return Ok(());
        }
        let path = event.node_path()?;
        let user = path
            .list_key("user", "name")
            .ok_or_else(|| ReconcileError::key(&event.path))?
            .to_string();
        let name = path
            .list_key("authorized-key", "name")
            .ok_or_else(|| ReconcileError::key(&event.path))?
            .to_string();
        crate::identity::validate_user_name(&user)
            .map_err(|err| ReconcileError::invalid(err.to_string()))?;
        check_key_name(&name)?;

        let leaf = path.below("authorized-key").last().copied();
        let list = self.list_for(&user)?;
        match event.operation {
            ChangeOperation::Create | ChangeOperation::Modify => match leaf {
                Some("algorithm") => list.upsert(&name).algorithm = event.required_value()?.trim().to_string(),
                Some("key-data") => {
                    let data = event.required_value()?.trim();
                    decode_key_data(&name, data)?;
                    list.upsert(&name).key_data = data.to_string();
                }
                _ => {
                    list.upsert(&name);
                }
            },
            ChangeOperation::Delete => {
                if leaf.is_none() && !list.remove(&name) {
                    debug!("user {user}: key {name} already absent");
                }
            }
            ChangeOperation::Move => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        self.lists.iter().try_for_each(AuthorizedKeyList::validate)
    }

    fn store(&mut self) -> Result<(), ReconcileError> {
        self.validate()?;
        self.lists.iter().try_for_each(AuthorizedKeyList::store)
    }
}
