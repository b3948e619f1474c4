//! Permission catalog and role records
//!
//! Permissions form a closed catalog: every role carries one named boolean
//! per [`Permission`], so adding a permission is a compile-time change that
//! every match over the catalog has to acknowledge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{IpRule, ValidationError};

/// A single capability a role may grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Browse and download images
    ViewImages,
    /// Upload new images
    UploadImages,
    /// Edit image metadata
    EditImages,
    /// Remove images
    DeleteImages,
    /// Create and rename categories
    ManageCategories,
    /// Read usage statistics
    ViewAnalytics,
    /// Administer user accounts
    ManageUsers,
    /// Create, edit and revoke roles
    ManageRoles,
}

impl Permission {
    pub fn all() -> [Permission; 8] {
        [
            Permission::ViewImages,
            Permission::UploadImages,
            Permission::EditImages,
            Permission::DeleteImages,
            Permission::ManageCategories,
            Permission::ViewAnalytics,
            Permission::ManageUsers,
            Permission::ManageRoles,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ViewImages => "view_images",
            Permission::UploadImages => "upload_images",
            Permission::EditImages => "edit_images",
            Permission::DeleteImages => "delete_images",
            Permission::ManageCategories => "manage_categories",
            Permission::ViewAnalytics => "view_analytics",
            Permission::ManageUsers => "manage_users",
            Permission::ManageRoles => "manage_roles",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The permissions granted by a role, one flag per catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    pub view_images: bool,
    pub upload_images: bool,
    pub edit_images: bool,
    pub delete_images: bool,
    pub manage_categories: bool,
    pub view_analytics: bool,
    pub manage_users: bool,
    pub manage_roles: bool,
}

impl PermissionSet {
    /// A set with every permission granted
    pub fn all() -> Self {
        Permission::all()
            .into_iter()
            .fold(Self::default(), |set, permission| set.with(permission))
    }

    /// Builder-style grant
    pub fn with(mut self, permission: Permission) -> Self {
        *self.flag_mut(permission) = true;
        self
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::ViewImages => self.view_images,
            Permission::UploadImages => self.upload_images,
            Permission::EditImages => self.edit_images,
            Permission::DeleteImages => self.delete_images,
            Permission::ManageCategories => self.manage_categories,
            Permission::ViewAnalytics => self.view_analytics,
            Permission::ManageUsers => self.manage_users,
            Permission::ManageRoles => self.manage_roles,
        }
    }

    /// Granted permissions in catalog order
    pub fn granted(&self) -> impl Iterator<Item = Permission> + '_ {
        Permission::all().into_iter().filter(|p| self.allows(*p))
    }

    fn flag_mut(&mut self, permission: Permission) -> &mut bool {
        match permission {
            Permission::ViewImages => &mut self.view_images,
            Permission::UploadImages => &mut self.upload_images,
            Permission::EditImages => &mut self.edit_images,
            Permission::DeleteImages => &mut self.delete_images,
            Permission::ManageCategories => &mut self.manage_categories,
            Permission::ViewAnalytics => &mut self.view_analytics,
            Permission::ManageUsers => &mut self.manage_users,
            Permission::ManageRoles => &mut self.manage_roles,
        }
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), |set, p| set.with(p))
    }
}

/// A validated role as held by a role store
///
/// Only constructed through [`RoleDraft::validate`], so `allowed_ips` is
/// always well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleRecord {
    user_id: String,
    permissions: PermissionSet,
    expires_at: Option<DateTime<Utc>>,
    active: bool,
    allowed_ips: Vec<IpRule>,
}

impl RoleRecord {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn permissions(&self) -> PermissionSet {
        self.permissions
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn allowed_ips(&self) -> &[IpRule] {
        &self.allowed_ips
    }

    /// Whether decisions for this role depend on the caller's address
    pub fn is_ip_restricted(&self) -> bool {
        !self.allowed_ips.is_empty()
    }

    /// Start an edit of this record
    pub fn to_draft(&self) -> RoleDraft {
        RoleDraft {
            user_id: self.user_id.clone(),
            permissions: self.permissions,
            expires_at: self.expires_at,
            active: self.active,
            allowed_ips: self.allowed_ips.iter().map(|rule| rule.to_string()).collect(),
        }
    }
}

/// Unvalidated role as submitted by an admin operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDraft {
    pub user_id: String,
    #[serde(default)]
    pub permissions: PermissionSet,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl RoleDraft {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            permissions: PermissionSet::default(),
            expires_at: None,
            active: true,
            allowed_ips: Vec::new(),
        }
    }

    pub fn permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn allow_ip(mut self, entry: impl Into<String>) -> Self {
        self.allowed_ips.push(entry.into());
        self
    }

    /// Parse every allowlist entry; the first malformed one rejects the draft
    pub fn validate(self) -> Result<RoleRecord, ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::EmptyUserId);
        }

        let mut allowed_ips = Vec::with_capacity(self.allowed_ips.len());
        for entry in &self.allowed_ips {
            let rule = IpRule::parse(entry)?;
            if !allowed_ips.contains(&rule) {
                allowed_ips.push(rule);
            }
        }

        Ok(RoleRecord {
            user_id: self.user_id,
            permissions: self.permissions,
            expires_at: self.expires_at,
            active: self.active,
            allowed_ips,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_set_all_grants_everything() {
        let all = PermissionSet::all();
        for permission in Permission::all() {
            assert!(all.allows(permission), "{permission} should be granted");
        }
        assert_eq!(all.granted().count(), Permission::all().len());
    }

    #[test]
    fn test_permission_set_from_iter() {
        let set: PermissionSet = [Permission::ViewImages, Permission::UploadImages]
            .into_iter()
            .collect();
        assert!(set.view_images);
        assert!(set.upload_images);
        assert!(!set.delete_images);
        assert_eq!(
            set.granted().collect::<Vec<_>>(),
            vec![Permission::ViewImages, Permission::UploadImages]
        );
    }

    #[test]
    fn test_permission_set_deserializes_missing_flags_as_false() {
        let set: PermissionSet = serde_json::from_str(r#"{"view_images": true}"#).unwrap();
        assert!(set.allows(Permission::ViewImages));
        assert!(!set.allows(Permission::ManageRoles));
    }

    #[test]
    fn test_draft_validation_parses_ips() {
        let role = RoleDraft::new("alice")
            .allow_ip("192.168.1.0/24")
            .allow_ip("2001:db8::1")
            .validate()
            .unwrap();

        assert!(role.is_ip_restricted());
        assert_eq!(role.allowed_ips().len(), 2);
    }

    #[test]
    fn test_draft_validation_rejects_malformed_ip() {
        let err = RoleDraft::new("alice")
            .allow_ip("192.168.1.0/24")
            .allow_ip("192.168.1.300")
            .validate()
            .unwrap_err();

        assert_eq!(
            err,
            ValidationError::MalformedIpEntry {
                entry: "192.168.1.300".to_string(),
                reason: "not an IP address".to_string(),
            }
        );
    }

    #[test]
    fn test_draft_validation_rejects_empty_user() {
        assert_eq!(
            RoleDraft::new("  ").validate().unwrap_err(),
            ValidationError::EmptyUserId
        );
    }

    #[test]
    fn test_duplicate_ip_entries_collapse() {
        let role = RoleDraft::new("alice")
            .allow_ip("10.0.0.1")
            .allow_ip(" 10.0.0.1 ")
            .validate()
            .unwrap();
        assert_eq!(role.allowed_ips().len(), 1);
    }

    #[test]
    fn test_to_draft_round_trip() {
        let role = RoleDraft::new("carol")
            .permissions(PermissionSet::default().with(Permission::ViewAnalytics))
            .allow_ip("10.1.0.0/16")
            .active(false)
            .validate()
            .unwrap();

        assert_eq!(role.to_draft().validate().unwrap(), role);
    }
}
