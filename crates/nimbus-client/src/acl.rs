//! Access control lists attached to records.
//!
//! The list only describes permissions; the server enforces them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const PUBLIC_KEY: &str = "*";
const ROLE_PREFIX: &str = "role:";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Permission {
    #[serde(default, skip_serializing_if = "is_false")]
    read: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    write: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Read/write grants keyed by user id, role, or the public wildcard.
///
/// Serialized as `{"*": {"read": true}, "role:Admin": {"write": true}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Acl {
    permissions: BTreeMap<String, Permission>,
}

impl Acl {
    /// An ACL granting nothing to anyone.
    pub fn new() -> Self {
        Self::default()
    }

    /// An ACL granting read and write to a single user.
    pub fn for_user(user_id: &str) -> Self {
        let mut acl = Self::new();
        acl.set_read_access(user_id, true);
        acl.set_write_access(user_id, true);
        acl
    }

    fn set(&mut self, key: String, update: impl FnOnce(&mut Permission)) {
        let entry = self.permissions.entry(key.clone()).or_default();
        update(entry);
        if *entry == Permission::default() {
            self.permissions.remove(&key);
        }
    }

    fn get(&self, key: &str) -> Permission {
        self.permissions.get(key).copied().unwrap_or_default()
    }

    pub fn set_public_read_access(&mut self, allowed: bool) {
        self.set(PUBLIC_KEY.to_string(), |p| p.read = allowed);
    }

    pub fn public_read_access(&self) -> bool {
        self.get(PUBLIC_KEY).read
    }

    pub fn set_public_write_access(&mut self, allowed: bool) {
        self.set(PUBLIC_KEY.to_string(), |p| p.write = allowed);
    }

    pub fn public_write_access(&self) -> bool {
        self.get(PUBLIC_KEY).write
    }

    pub fn set_read_access(&mut self, user_id: &str, allowed: bool) {
        self.set(user_id.to_string(), |p| p.read = allowed);
    }

    pub fn read_access(&self, user_id: &str) -> bool {
        self.get(user_id).read
    }

    pub fn set_write_access(&mut self, user_id: &str, allowed: bool) {
        self.set(user_id.to_string(), |p| p.write = allowed);
    }

    pub fn write_access(&self, user_id: &str) -> bool {
        self.get(user_id).write
    }

    pub fn set_role_read_access(&mut self, role_name: &str, allowed: bool) {
        self.set(format!("{ROLE_PREFIX}{role_name}"), |p| p.read = allowed);
    }

    pub fn role_read_access(&self, role_name: &str) -> bool {
        self.get(&format!("{ROLE_PREFIX}{role_name}")).read
    }

    pub fn set_role_write_access(&mut self, role_name: &str, allowed: bool) {
        self.set(format!("{ROLE_PREFIX}{role_name}"), |p| p.write = allowed);
    }

    pub fn role_write_access(&self, role_name: &str) -> bool {
        self.get(&format!("{ROLE_PREFIX}{role_name}")).write
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}
