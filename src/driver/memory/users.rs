use crate::core::{DriverError, DriverResult, UserSpec};
use crate::driver::memory::codes;
use log::error;
use std::collections::BTreeMap;

pub const ADMIN_USER: &str = "SYSDBA";
pub const ADMIN_PASSWORD: &str = "masterkey";

/// bcrypt cost for stored hashes; kept low because every attach verifies one.
const HASH_COST: u32 = 4;

/// Security database entry
#[derive(Debug, Clone)]
pub struct UserRecord {
    password_hash: String,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
}

/// Server-wide user accounts
///
/// Names are case-insensitive and stored upper-cased.
#[derive(Debug)]
pub struct UserRegistry {
    users: BTreeMap<String, UserRecord>,
}

impl UserRegistry {
    /// Creates a registry holding only the administrator
    pub fn with_admin(password: &str) -> Self {
        let mut users = BTreeMap::new();
        match hash_password(password) {
            Ok(password_hash) => {
                users.insert(
                    ADMIN_USER.to_string(),
                    UserRecord {
                        password_hash,
                        first_name: None,
                        middle_name: None,
                        last_name: None,
                    },
                );
            }
            Err(e) => error!("administrator account not created: {}", e),
        }
        Self { users }
    }

    /// Verifies the password against the stored hash
    pub fn authenticate(&self, user: &str, password: &str) -> bool {
        self.users
            .get(&user.to_uppercase())
            .map(|u| bcrypt::verify(password, &u.password_hash).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn add(&mut self, spec: &UserSpec) -> DriverResult<()> {
        let name = validate_username(&spec.user_name)?;
        if self.users.contains_key(&name) {
            return Err(DriverError::new(
                codes::UNIQUE_KEY_VIOLATION,
                format!("add record error: user {} already exists", name),
            ));
        }

        let record = UserRecord {
            password_hash: hash_password(&spec.password)?,
            first_name: spec.first_name.clone(),
            middle_name: spec.middle_name.clone(),
            last_name: spec.last_name.clone(),
        };
        self.users.insert(name, record);
        Ok(())
    }

    /// Updates the password and any name parts given in `spec`
    pub fn modify(&mut self, spec: &UserSpec) -> DriverResult<()> {
        let name = spec.user_name.to_uppercase();
        let password_hash = if spec.password.is_empty() {
            None
        } else {
            Some(hash_password(&spec.password)?)
        };

        let user = self.users.get_mut(&name).ok_or_else(|| not_found(&name))?;
        if let Some(hash) = password_hash {
            user.password_hash = hash;
        }
        if spec.first_name.is_some() {
            user.first_name = spec.first_name.clone();
        }
        if spec.middle_name.is_some() {
            user.middle_name = spec.middle_name.clone();
        }
        if spec.last_name.is_some() {
            user.last_name = spec.last_name.clone();
        }
        Ok(())
    }

    pub fn delete(&mut self, user: &str) -> DriverResult<()> {
        let name = user.to_uppercase();
        if name == ADMIN_USER {
            return Err(DriverError::new(
                codes::NO_PRIV,
                "Cannot delete the administrator account",
            ));
        }
        self.users
            .remove(&name)
            .map(|_| ())
            .ok_or_else(|| not_found(&name))
    }

    pub fn names(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn get(&self, user: &str) -> Option<&UserRecord> {
        self.users.get(&user.to_uppercase())
    }
}

fn hash_password(password: &str) -> DriverResult<String> {
    bcrypt::hash(password, HASH_COST)
        .map_err(|e| DriverError::without_code(format!("Failed to hash password: {}", e)))
}

fn validate_username(name: &str) -> DriverResult<String> {
    if name.is_empty() {
        return Err(DriverError::new(codes::NOT_VALID, "Username cannot be empty"));
    }
    if name.len() > 31 {
        return Err(DriverError::new(
            codes::NOT_VALID,
            "Username too long (max 31 characters)",
        ));
    }
    Ok(name.to_uppercase())
}

fn not_found(name: &str) -> DriverError {
    DriverError::new(
        codes::USER_NOT_FOUND,
        format!("record not found for user: {}", name),
    )
}
