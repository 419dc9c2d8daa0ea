//! Roles: named groups of users and other roles used in ACLs.

use serde_json::Value;

use crate::types::Pointer;
use crate::{Acl, ErrorCode, NimbusError, Record, RecordKind, Relation};

/// A `_Role` record.
#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    record: Record,
}

fn validate_name(name: &str) -> Result<(), NimbusError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' '));
    if valid {
        Ok(())
    } else {
        Err(NimbusError::invalid(
            ErrorCode::InvalidRoleName,
            format!(
                "role name {name:?} may only contain alphanumerics, underscores, hyphens, and spaces"
            ),
        ))
    }
}

impl Role {
    /// A new, unsaved role. Roles need an ACL to be saved.
    pub fn new(name: &str, acl: Acl) -> Result<Self, NimbusError> {
        validate_name(name)?;
        let mut record = Record::new(RecordKind::Role);
        record.set("name", name).set_acl(acl);
        Ok(Self { record })
    }

    pub fn from_record(record: Record) -> Result<Self, NimbusError> {
        if record.kind() != &RecordKind::Role {
            return Err(NimbusError::invalid(
                ErrorCode::InvalidClassName,
                format!("expected a _Role record, got {}", record.kind()),
            ));
        }
        Ok(Self { record })
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    pub fn name(&self) -> Option<&str> {
        self.record.get("name").and_then(Value::as_str)
    }

    /// Rename an unsaved role. Saved roles keep their name.
    pub fn set_name(&mut self, name: &str) -> Result<(), NimbusError> {
        if self.record.id().is_some() {
            return Err(NimbusError::invalid(
                ErrorCode::OperationForbidden,
                "a role's name can only be set before it has been saved",
            ));
        }
        validate_name(name)?;
        self.record.set("name", name);
        Ok(())
    }

    /// Queue users to be added to this role.
    pub fn add_users(&mut self, users: &[Pointer]) -> Result<&mut Self, NimbusError> {
        self.record.add_relation("users", users)?;
        Ok(self)
    }

    /// Queue child roles whose members inherit this role.
    pub fn add_roles(&mut self, roles: &[Pointer]) -> Result<&mut Self, NimbusError> {
        self.record.add_relation("roles", roles)?;
        Ok(self)
    }

    /// Users directly in this role.
    pub fn users(&self) -> Result<Relation, NimbusError> {
        let parent = self.saved_pointer()?;
        Ok(Relation::new(
            parent,
            "users",
            Some(RecordKind::User.class_name().to_string()),
        ))
    }

    /// Roles whose members inherit this role.
    pub fn roles(&self) -> Result<Relation, NimbusError> {
        let parent = self.saved_pointer()?;
        Ok(Relation::new(
            parent,
            "roles",
            Some(RecordKind::Role.class_name().to_string()),
        ))
    }

    fn saved_pointer(&self) -> Result<Pointer, NimbusError> {
        self.record.pointer().ok_or_else(|| {
            NimbusError::invalid(
                ErrorCode::MissingObjectId,
                "role relations need a saved role",
            )
        })
    }
}
