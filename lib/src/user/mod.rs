//! Account directory.
//!
//! Site accounts are owned by the surrounding platform. The core keeps a
//! mirror of the fields it needs for identity resolution: the email, the
//! names and the active/staff flags.

use chrono::{DateTime, Utc};

use crate::db::{Collectable, Database, Id, Identifiable};
use crate::error::Result;
use crate::util::normalize_email;

pub type UserId = Id;

/// User data structure.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct User {
    pub id: UserId,

    pub email: String,
    pub first_name: String,
    pub last_name: String,

    pub is_active: bool,
    pub is_staff: bool,

    pub date_joined: DateTime<Utc>,
}

impl Default for User {
    fn default() -> Self {
        Self {
            id: 0,
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            is_active: true,
            is_staff: false,
            date_joined: Utc::now(),
        }
    }
}

impl Collectable for User {
    fn get_collection_name() -> &'static str {
        "users"
    }
}

impl Identifiable for User {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl User {
    pub fn new(db: &Database, email: &str, first_name: &str, last_name: &str) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            email: normalize_email(email),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            ..Default::default()
        })
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Finds the active account owning the email, if any.
pub fn find_active_by_email(db: &Database, email: &str) -> Result<Option<User>> {
    let email = normalize_email(email);
    if email.is_empty() {
        return Ok(None);
    }
    db.find::<User, _>(|u| u.is_active && normalize_email(&u.email) == email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_accounts_are_not_resolved() {
        let db = Database::temporary().unwrap();
        let mut user = User::new(&db, "Jane@Example.com", "Jane", "Doe").unwrap();
        db.set(&user).unwrap();
        assert_eq!(
            find_active_by_email(&db, "jane@example.com")
                .unwrap()
                .map(|u| u.id),
            Some(user.id)
        );

        user.is_active = false;
        db.set(&user).unwrap();
        assert!(find_active_by_email(&db, "jane@example.com")
            .unwrap()
            .is_none());
    }
}
