//! The classic `passwd`/`shadow`/`group`/`gshadow` text files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use super::{
    ExtraFields, GroupRecord, IdentityError, IdentityStore, ShadowAging, UserDatabase, UserRecord,
};
use crate::fsutil::replace_file;

/// Identity database stored in the four colon-separated files of one directory (usually `/etc`).
///
/// Each file is rewritten through a sibling temporary file that is renamed into place, keeping
/// the previous permissions. The four renames are separate steps.
pub struct FlatFileIdentityStore {
    dir: PathBuf,
}

impl FlatFileIdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn read_required(path: &Path) -> Result<String, IdentityError> {
    fs::read_to_string(path)
        .map_err(|err| IdentityError::Unavailable(format!("{}: {err}", path.display())))
}

fn read_optional(path: &Path) -> Result<String, IdentityError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

fn records(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn fields<'a>(line: &'a str, min: usize, file: &str) -> Result<Vec<&'a str>, IdentityError> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < min {
        return Err(IdentityError::Corrupt(format!(
            "{file}: expected {min} fields in {line:?}"
        )));
    }
    Ok(parts)
}

fn id(raw: &str, file: &str) -> Result<u32, IdentityError> {
    raw.parse()
        .map_err(|_| IdentityError::Corrupt(format!("{file}: bad id {raw:?}")))
}

fn days(raw: &str, file: &str) -> Result<Option<i64>, IdentityError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| IdentityError::Corrupt(format!("{file}: bad day count {raw:?}")))
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

fn opt_days(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn tail(fields: &[&str], from: usize) -> Vec<String> {
    fields.get(from..).unwrap_or_default().iter().map(|f| f.to_string()).collect()
}

/// `line` followed by `:field` for each extra field.
fn push_line(out: &mut String, line: String, extra: &[String]) {
    out.push_str(&line);
    for field in extra {
        out.push(':');
        out.push_str(field);
    }
    out.push('\n');
}

fn parse(
    passwd: &str,
    shadow: &str,
    group: &str,
    gshadow: &str,
) -> Result<UserDatabase, IdentityError> {
    let mut users = Vec::new();
    for line in records(passwd) {
        let f = fields(line, 7, "passwd")?;
        users.push(UserRecord {
            name: f[0].to_string(),
            password: f[1].to_string(),
            uid: id(f[2], "passwd")?,
            gid: id(f[3], "passwd")?,
            gecos: f[4].to_string(),
            home: f[5].to_string(),
            shell: f[6].to_string(),
            password_hash: None,
            aging: ShadowAging::default(),
            extra: ExtraFields {
                primary: tail(&f, 7),
                shadow: None,
            },
        });
    }
    for line in records(shadow) {
        let f = fields(line, 8, "shadow")?;
        let Some(user) = users.iter_mut().find(|u| u.name == f[0]) else {
            debug!("shadow entry {} has no passwd entry", f[0]);
            continue;
        };
        user.password_hash = Some(f[1].to_string());
        user.aging = ShadowAging {
            last_change: days(f[2], "shadow")?,
            change_min: days(f[3], "shadow")?,
            change_max: days(f[4], "shadow")?,
            warn_days: days(f[5], "shadow")?,
            inactive_days: days(f[6], "shadow")?,
            expiration: days(f[7], "shadow")?,
        };
        user.extra.shadow = Some(tail(&f, 8));
    }

    let mut groups = Vec::new();
    for line in records(group) {
        let f = fields(line, 4, "group")?;
        groups.push(GroupRecord {
            name: f[0].to_string(),
            password: f[1].to_string(),
            gid: id(f[2], "group")?,
            password_hash: None,
            members: list(f[3]),
            admins: Vec::new(),
            extra: ExtraFields {
                primary: tail(&f, 4),
                shadow: None,
            },
        });
    }
    for line in records(gshadow) {
        let f = fields(line, 4, "gshadow")?;
        let Some(group) = groups.iter_mut().find(|g| g.name == f[0]) else {
            debug!("gshadow entry {} has no group entry", f[0]);
            continue;
        };
        group.password_hash = Some(f[1].to_string());
        group.admins = list(f[2]);
        group.members = list(f[3]);
        group.extra.shadow = Some(tail(&f, 4));
    }

    Ok(UserDatabase::new(users, groups))
}

struct Rendered {
    passwd: String,
    shadow: String,
    group: String,
    gshadow: String,
}

/// Records without a hash get no shadow line. Shadow lines of users that had none before carry
/// the empty reserved ninth field.
fn render(db: &UserDatabase) -> Rendered {
    let mut out = Rendered {
        passwd: String::new(),
        shadow: String::new(),
        group: String::new(),
        gshadow: String::new(),
    };
    let reserved = [String::new()];
    for u in db.users() {
        push_line(
            &mut out.passwd,
            format!(
                "{}:{}:{}:{}:{}:{}:{}",
                u.name, u.password, u.uid, u.gid, u.gecos, u.home, u.shell
            ),
            &u.extra.primary,
        );
        if let Some(hash) = &u.password_hash {
            push_line(
                &mut out.shadow,
                format!(
                    "{}:{}:{}:{}:{}:{}:{}:{}",
                    u.name,
                    hash,
                    opt_days(u.aging.last_change),
                    opt_days(u.aging.change_min),
                    opt_days(u.aging.change_max),
                    opt_days(u.aging.warn_days),
                    opt_days(u.aging.inactive_days),
                    opt_days(u.aging.expiration),
                ),
                u.extra.shadow.as_deref().unwrap_or(&reserved),
            );
        }
    }
    for g in db.groups() {
        push_line(
            &mut out.group,
            format!("{}:{}:{}:{}", g.name, g.password, g.gid, g.members.join(",")),
            &g.extra.primary,
        );
        if let Some(hash) = &g.password_hash {
            push_line(
                &mut out.gshadow,
                format!(
                    "{}:{}:{}:{}",
                    g.name,
                    hash,
                    g.admins.join(","),
                    g.members.join(",")
                ),
                g.extra.shadow.as_deref().unwrap_or_default(),
            );
        }
    }
    out
}

impl IdentityStore for FlatFileIdentityStore {
    fn load(&self) -> Result<UserDatabase, IdentityError> {
        parse(
            &read_required(&self.file("passwd"))?,
            &read_optional(&self.file("shadow"))?,
            &read_required(&self.file("group"))?,
            &read_optional(&self.file("gshadow"))?,
        )
    }

    fn commit(&self, db: &UserDatabase) -> Result<(), IdentityError> {
        let rendered = render(db);
        replace_file(&self.file("shadow"), &rendered.shadow)?;
        replace_file(&self.file("gshadow"), &rendered.gshadow)?;
        replace_file(&self.file("group"), &rendered.group)?;
        replace_file(&self.file("passwd"), &rendered.passwd)?;
        Ok(())
    }
}
