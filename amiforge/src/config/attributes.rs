//! Named image-attribute modification requests.
//!
//! Each entry is applied with its own call so one failure is reported on its
//! own and never rolls back an entry applied before it.

use crate::cloud::{ImageAttributeChange, LaunchPermission};
use std::collections::BTreeMap;

/// Attribute values to apply to a finished image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageAttributes<'a> {
    /// New description.
    pub description: &'a str,
    /// Accounts granted launch permission.
    pub users: &'a [String],
    /// Groups granted launch permission.
    pub groups: &'a [String],
    /// Organizations granted launch permission.
    pub org_arns: &'a [String],
    /// Organizational units granted launch permission.
    pub ou_arns: &'a [String],
    /// IMDS support to enforce.
    pub imds_support: &'a str,
    /// Product codes to attach.
    pub product_codes: &'a [String],
}

impl ImageAttributes<'_> {
    /// Builds the named requests; empty fields produce no entry.
    #[must_use]
    pub fn modifications(&self) -> BTreeMap<&'static str, ImageAttributeChange> {
        let mut options = BTreeMap::new();

        if !self.description.is_empty() {
            options.insert(
                "description",
                ImageAttributeChange::Description(self.description.to_string()),
            );
        }

        let grants: [(&'static str, &[String], fn(String) -> LaunchPermission); 4] = [
            ("groups", self.groups, LaunchPermission::Group),
            ("users", self.users, LaunchPermission::User),
            ("ami org arns", self.org_arns, LaunchPermission::OrganizationArn),
            ("ami ou arns", self.ou_arns, LaunchPermission::OrganizationalUnitArn),
        ];
        for (name, principals, permission) in grants {
            if principals.is_empty() {
                continue;
            }
            options.insert(
                name,
                ImageAttributeChange::LaunchPermissionAdd(
                    principals.iter().cloned().map(permission).collect(),
                ),
            );
        }

        if !self.imds_support.is_empty() {
            options.insert(
                "ami imds support",
                ImageAttributeChange::ImdsSupport(self.imds_support.to_string()),
            );
        }

        if !self.product_codes.is_empty() {
            options.insert(
                "product codes",
                ImageAttributeChange::ProductCodes(self.product_codes.to_vec()),
            );
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_only_users_yields_one_request() {
        let users = vec!["111111111111".to_string()];
        let attrs = ImageAttributes {
            users: &users,
            ..ImageAttributes::default()
        };

        let options = attrs.modifications();
        assert_eq!(options.len(), 1);
        assert_eq!(
            options.get("users"),
            Some(&ImageAttributeChange::LaunchPermissionAdd(vec![
                LaunchPermission::User("111111111111".to_string())
            ]))
        );
        assert!(!options.contains_key("description"));
        assert!(!options.contains_key("groups"));
        assert!(!options.contains_key("ami org arns"));
        assert!(!options.contains_key("ami ou arns"));
    }

    #[test]
    fn test_empty_attributes_yield_nothing() {
        assert!(ImageAttributes::default().modifications().is_empty());
    }

    #[test]
    fn test_every_field_maps_to_named_entry() {
        let one = vec!["x".to_string()];
        let attrs = ImageAttributes {
            description: "desc",
            users: &one,
            groups: &one,
            org_arns: &one,
            ou_arns: &one,
            imds_support: "v2.0",
            product_codes: &one,
        };

        let names: Vec<_> = attrs.modifications().into_keys().collect();
        assert_eq!(
            names,
            vec![
                "ami imds support",
                "ami org arns",
                "ami ou arns",
                "description",
                "groups",
                "product codes",
                "users",
            ]
        );
    }
}
