// This wraps the accounts database.
// It stores users, their approval state, what they may use, and a pointer to their latest image.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    catalog::ModelCatalog,
    error::StudioError,
    permissions::{CharacterAccess, Permissions},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Checkpoint,
    Lora,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "admin" => Ok(UserRole::Admin),
            "user" => Ok(UserRole::User),
            other => bail!("unknown role {:?}", other),
        }
    }
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Approved => "approved",
            Status::Rejected => "rejected",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "pending" => Ok(Status::Pending),
            "approved" => Ok(Status::Approved),
            "rejected" => Ok(Status::Rejected),
            other => bail!("unknown status {:?}", other),
        }
    }
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Checkpoint => "checkpoint",
            ModelType::Lora => "lora",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub username: String,
    pub email: String,
    pub role: UserRole,
    pub status: Status,
    pub can_delete_files: bool,
    pub latest_prompt: Option<String>,
    pub latest_image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserCounts {
    pub total: u64,
    pub admins: u64,
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
}

const USER_COLUMNS: &str =
    "username, email, role, status, can_delete_files, latest_prompt, latest_image";

type UserRow = (String, String, String, String, bool, Option<String>, Option<String>);

fn user_row(row: &rusqlite::Row) -> rusqlite::Result<UserRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        let (username, email, role, status, can_delete_files, latest_prompt, latest_image) = row;
        Ok(User {
            username,
            email,
            role: UserRole::parse(&role)?,
            status: Status::parse(&status)?,
            can_delete_files,
            latest_prompt,
            latest_image,
        })
    }
}

#[derive(Clone)]
pub struct DatabaseModule(Arc<Mutex<Connection>>);

impl DatabaseModule {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(path).context("failed to open database")?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("failed to open database")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])
            .context("failed to enable foreign keys")?;
        conn.execute_batch(include_str!("../schema.sql"))
            .context("failed to initialize database")?;
        info!("Database initialized");
        Ok(Self(Arc::new(Mutex::new(conn))))
    }

    // Non-public functions do NOT lock the database mutex.

    fn find_user(conn: &Connection, username: &str) -> Result<Option<User>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE username = ?", USER_COLUMNS),
                [username],
                user_row,
            )
            .optional()
            .context("failed to look up user")?;
        row.map(User::try_from).transpose()
    }

    fn require_user(conn: &Connection, username: &str) -> Result<User> {
        Self::find_user(conn, username)?.with_context(|| format!("no such user: {}", username))
    }

    /// Overrides only; a character missing here gets full access.
    fn character_defaults(conn: &Connection) -> Result<BTreeMap<String, CharacterAccess>> {
        let mut stmt = conn.prepare("SELECT character, can_generate, can_browse FROM default_character_permissions")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                CharacterAccess {
                    can_generate: row.get(1)?,
                    can_browse: row.get(2)?,
                },
            ))
        })?;
        let defaults = rows
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .context("failed to read default character permissions")?;
        Ok(defaults)
    }

    // Public functions MUST lock the database mutex.

    /// Admins are approved on creation; everyone else waits for approval.
    pub async fn add_user(&self, username: &str, email: &str, role: UserRole) -> Result<User> {
        let conn = self.0.lock().await;
        let status = match role {
            UserRole::Admin => Status::Approved,
            UserRole::User => Status::Pending,
        };
        conn.execute(
            "INSERT INTO users (username, email, role, status, can_delete_files) VALUES (?, ?, ?, ?, ?)",
            params![username, email, role.as_str(), status.as_str(), role == UserRole::Admin],
        )
        .with_context(|| format!("failed to add user {}", username))?;
        info!("Added {} {} ({})", role.as_str(), username, status);
        Self::require_user(&conn, username)
    }

    pub async fn user(&self, username: &str) -> Result<Option<User>> {
        let conn = self.0.lock().await;
        Self::find_user(&conn, username)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.0.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users ORDER BY created_at, username",
            USER_COLUMNS
        ))?;
        let rows = stmt.query_map([], user_row)?;
        let mut users = vec![];
        for row in rows {
            users.push(User::try_from(row?)?);
        }
        Ok(users)
    }

    pub async fn delete_user(&self, username: &str) -> Result<bool> {
        let conn = self.0.lock().await;
        let deleted = conn
            .execute("DELETE FROM users WHERE username = ?", [username])
            .context("failed to delete user")?;
        Ok(deleted > 0)
    }

    /// Approves a pending user, granting every catalogued model and every configured character.
    /// Character access follows the defaults set with `set_default_character_permissions`.
    pub async fn approve(&self, username: &str, catalog: &ModelCatalog, characters: &[String]) -> Result<()> {
        let mut conn = self.0.lock().await;
        let user = Self::require_user(&conn, username)?;
        if user.status != Status::Pending {
            bail!("{} is {}, not pending", username, user.status);
        }
        let tx = conn.transaction()?;
        tx.execute("UPDATE users SET status = 'approved' WHERE username = ?", [username])?;
        for (model_type, names) in [
            (ModelType::Checkpoint, &catalog.checkpoints),
            (ModelType::Lora, &catalog.loras),
        ] {
            for name in names {
                tx.execute(
                    "INSERT OR IGNORE INTO model_permissions (username, model_type, name) VALUES (?, ?, ?)",
                    params![username, model_type.as_str(), name],
                )?;
            }
        }
        let defaults = Self::character_defaults(&tx)?;
        for character in characters {
            let access = defaults.get(character).copied().unwrap_or(CharacterAccess::FULL);
            if !(access.can_generate || access.can_browse) {
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO character_permissions (username, character, can_generate, can_browse) VALUES (?, ?, ?, ?)",
                params![username, character, access.can_generate, access.can_browse],
            )?;
        }
        tx.commit().context("failed to approve user")?;
        info!(
            "Approved {} with {} checkpoints, {} LoRAs and {} characters",
            username,
            catalog.checkpoints.len(),
            catalog.loras.len(),
            characters.len()
        );
        Ok(())
    }

    pub async fn reject(&self, username: &str) -> Result<()> {
        let conn = self.0.lock().await;
        let user = Self::require_user(&conn, username)?;
        if user.status != Status::Pending {
            bail!("{} is {}, not pending", username, user.status);
        }
        conn.execute("UPDATE users SET status = 'rejected' WHERE username = ?", [username])?;
        info!("Rejected {}", username);
        Ok(())
    }

    /// Returns the new value.
    pub async fn toggle_delete(&self, username: &str) -> Result<bool> {
        let conn = self.0.lock().await;
        let user = Self::require_user(&conn, username)?;
        let allowed = !user.can_delete_files;
        conn.execute(
            "UPDATE users SET can_delete_files = ? WHERE username = ?",
            params![allowed, username],
        )?;
        info!("File deletion {} for {}", if allowed { "granted" } else { "revoked" }, username);
        Ok(allowed)
    }

    /// Replaces the user's character permissions. Entries granting nothing are dropped.
    pub async fn set_character_permissions(
        &self,
        username: &str,
        access: &BTreeMap<String, CharacterAccess>,
    ) -> Result<()> {
        let mut conn = self.0.lock().await;
        Self::require_user(&conn, username)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM character_permissions WHERE username = ?", [username])?;
        for (character, access) in access {
            if !(access.can_generate || access.can_browse) {
                continue;
            }
            tx.execute(
                "INSERT INTO character_permissions (username, character, can_generate, can_browse) VALUES (?, ?, ?, ?)",
                params![username, character, access.can_generate, access.can_browse],
            )?;
        }
        tx.commit().context("failed to update character permissions")?;
        Ok(())
    }

    /// Replaces the user's permissions for one kind of model.
    pub async fn set_model_permissions(&self, username: &str, model_type: ModelType, names: &[String]) -> Result<()> {
        let mut conn = self.0.lock().await;
        Self::require_user(&conn, username)?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM model_permissions WHERE username = ? AND model_type = ?",
            params![username, model_type.as_str()],
        )?;
        for name in names {
            tx.execute(
                "INSERT OR IGNORE INTO model_permissions (username, model_type, name) VALUES (?, ?, ?)",
                params![username, model_type.as_str(), name],
            )?;
        }
        tx.commit().context("failed to update model permissions")?;
        Ok(())
    }

    /// Everything the generation code needs to know about a user.
    /// Only approved accounts get permissions at all.
    pub async fn permissions(&self, username: &str) -> Result<Permissions> {
        let conn = self.0.lock().await;
        let user = Self::require_user(&conn, username)?;
        if user.status != Status::Approved {
            bail!(StudioError::AccountNotApproved(username.to_owned()));
        }
        if user.role == UserRole::Admin {
            return Ok(Permissions::unrestricted(username));
        }

        let mut characters = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT character, can_generate, can_browse FROM character_permissions WHERE username = ?",
        )?;
        let rows = stmt.query_map([username], |row| {
            Ok((
                row.get::<_, String>(0)?,
                CharacterAccess {
                    can_generate: row.get(1)?,
                    can_browse: row.get(2)?,
                },
            ))
        })?;
        for row in rows {
            let (character, access) = row?;
            characters.insert(character, access);
        }

        let mut checkpoints = BTreeSet::new();
        let mut loras = BTreeSet::new();
        let mut stmt = conn.prepare("SELECT model_type, name FROM model_permissions WHERE username = ?")?;
        let rows = stmt.query_map([username], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (model_type, name) = row?;
            if model_type == ModelType::Checkpoint.as_str() {
                checkpoints.insert(name);
            } else {
                loras.insert(name);
            }
        }

        Ok(Permissions {
            username: username.to_owned(),
            unrestricted: false,
            can_delete_files: user.can_delete_files,
            characters,
            checkpoints,
            loras,
        })
    }

    /// What approval would grant for each of `characters`.
    pub async fn default_character_permissions(
        &self,
        characters: &[String],
    ) -> Result<BTreeMap<String, CharacterAccess>> {
        let conn = self.0.lock().await;
        let defaults = Self::character_defaults(&conn)?;
        Ok(characters
            .iter()
            .map(|name| {
                let access = defaults.get(name).copied().unwrap_or(CharacterAccess::FULL);
                (name.clone(), access)
            })
            .collect())
    }

    /// Replaces the approval defaults. Only restrictions are stored.
    pub async fn set_default_character_permissions(&self, access: &BTreeMap<String, CharacterAccess>) -> Result<()> {
        let mut conn = self.0.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM default_character_permissions", [])?;
        for (character, access) in access {
            if *access == CharacterAccess::FULL {
                continue;
            }
            tx.execute(
                "INSERT INTO default_character_permissions (character, can_generate, can_browse) VALUES (?, ?, ?)",
                params![character, access.can_generate, access.can_browse],
            )?;
        }
        tx.commit().context("failed to update default character permissions")?;
        info!("Default character permissions updated");
        Ok(())
    }

    pub async fn user_counts(&self) -> Result<UserCounts> {
        let conn = self.0.lock().await;
        let mut stmt = conn.prepare("SELECT role, status, COUNT(*) FROM users GROUP BY role, status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, u64>(2)?))
        })?;
        let mut counts = UserCounts::default();
        for row in rows {
            let (role, status, n) = row?;
            counts.total += n;
            if UserRole::parse(&role)? == UserRole::Admin {
                counts.admins += n;
            }
            match Status::parse(&status)? {
                Status::Pending => counts.pending += n,
                Status::Approved => counts.approved += n,
                Status::Rejected => counts.rejected += n,
            }
        }
        Ok(counts)
    }

    /// Fails unless `username` is an approved admin.
    pub async fn require_admin(&self, username: &str) -> Result<()> {
        let conn = self.0.lock().await;
        match Self::find_user(&conn, username)? {
            Some(user) if user.role == UserRole::Admin && user.status == Status::Approved => Ok(()),
            _ => bail!(StudioError::PermissionDenied(format!("{} is not an admin", username))),
        }
    }

    pub async fn record_latest(&self, username: &str, prompt: &str, image: &Path) -> Result<()> {
        let conn = self.0.lock().await;
        let updated = conn
            .execute(
                "UPDATE users SET latest_prompt = ?, latest_image = ? WHERE username = ?",
                params![prompt, image.to_string_lossy().into_owned(), username],
            )
            .context("failed to record latest image")?;
        if updated == 0 {
            bail!("no such user: {}", username);
        }
        Ok(())
    }

    /// The latest prompt and image path.
    pub async fn latest(&self, username: &str) -> Result<(Option<String>, Option<String>)> {
        let conn = self.0.lock().await;
        let user = Self::require_user(&conn, username)?;
        Ok((user.latest_prompt, user.latest_image))
    }
}
