use rusqlite::{params, Row};

use super::{
    ExtraFields, GroupRecord, IdentityError, IdentityStore, ShadowAging, UserDatabase, UserRecord,
};
use crate::db::DbPool;

/// Identity database kept in the `identity_*` tables of the service database.
///
/// A commit rewrites the three tables inside one SQLite transaction, so readers see either the
/// old or the new database.
pub struct SqliteIdentityStore {
    pool: DbPool,
}

impl SqliteIdentityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        name: row.get(0)?,
        uid: row.get(1)?,
        gid: row.get(2)?,
        password: row.get(3)?,
        password_hash: row.get(4)?,
        gecos: row.get(5)?,
        home: row.get(6)?,
        shell: row.get(7)?,
        aging: ShadowAging {
            last_change: row.get(8)?,
            change_min: row.get(9)?,
            change_max: row.get(10)?,
            warn_days: row.get(11)?,
            inactive_days: row.get(12)?,
            expiration: row.get(13)?,
        },
        extra: ExtraFields::default(),
    })
}

impl IdentityStore for SqliteIdentityStore {
    fn load(&self) -> Result<UserDatabase, IdentityError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT name, uid, gid, password, password_hash, gecos, home, shell,
                    last_change, change_min, change_max, warn_days, inactive_days, expiration
             FROM identity_users ORDER BY rowid",
        )?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT name, gid, password, password_hash FROM identity_groups ORDER BY rowid",
        )?;
        let mut groups = stmt
            .query_map([], |row| {
                Ok(GroupRecord {
                    name: row.get(0)?,
                    gid: row.get(1)?,
                    password: row.get(2)?,
                    password_hash: row.get(3)?,
                    members: Vec::new(),
                    admins: Vec::new(),
                    extra: ExtraFields::default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT group_name, member, role FROM identity_group_members ORDER BY position",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (group_name, member, role) = row?;
            let group = groups
                .iter_mut()
                .find(|g| g.name == group_name)
                .ok_or_else(|| {
                    IdentityError::Corrupt(format!("member {member} of unknown group {group_name}"))
                })?;
            match role.as_str() {
                "admin" => group.admins.push(member),
                _ => group.members.push(member),
            }
        }

        Ok(UserDatabase::new(users, groups))
    }

    fn commit(&self, db: &UserDatabase) -> Result<(), IdentityError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM identity_group_members;
             DELETE FROM identity_groups;
             DELETE FROM identity_users;",
        )?;
        {
            let mut insert_user = tx.prepare(
                "INSERT INTO identity_users (name, uid, gid, password, password_hash, gecos, home,
                    shell, last_change, change_min, change_max, warn_days, inactive_days, expiration)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for u in db.users() {
                insert_user.execute(params![
                    u.name,
                    u.uid,
                    u.gid,
                    u.password,
                    u.password_hash,
                    u.gecos,
                    u.home,
                    u.shell,
                    u.aging.last_change,
                    u.aging.change_min,
                    u.aging.change_max,
                    u.aging.warn_days,
                    u.aging.inactive_days,
                    u.aging.expiration,
                ])?;
            }

            let mut insert_group = tx.prepare(
                "INSERT INTO identity_groups (name, gid, password, password_hash)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut insert_member = tx.prepare(
                "INSERT INTO identity_group_members (group_name, member, role, position)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for g in db.groups() {
                insert_group.execute(params![g.name, g.gid, g.password, g.password_hash])?;
                for (pos, member) in g.members.iter().enumerate() {
                    insert_member.execute(params![g.name, member, "member", pos as i64])?;
                }
                for (pos, admin) in g.admins.iter().enumerate() {
                    insert_member.execute(params![g.name, admin, "admin", pos as i64])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
