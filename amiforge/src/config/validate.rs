//! Field validators shared by every configuration block.

use once_cell::sync::Lazy;
use regex::Regex;

const KMS_KEY_ID: &str = r"[a-f0-9]+[a-f0-9-]+$";
const MRK_KEY_ID: &str = r"mrk-[a-f0-9]+[a-f0-9-]+$";
const KMS_ALIAS: &str = r"alias/[a-zA-Z0-9:/_-]+$";
const KMS_ARN_PREFIX: &str = r"^arn:aws(-[a-z]{2}(-gov)?)?:kms:([a-z]{2}-(gov-)?[a-z]+-\d{1})?:(\d{12}):";

static KMS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        format!("^{KMS_KEY_ID}"),
        format!("^{MRK_KEY_ID}"),
        format!("^{KMS_ALIAS}"),
        format!("{KMS_ARN_PREFIX}key/{KMS_KEY_ID}"),
        format!("{KMS_ARN_PREFIX}key/{MRK_KEY_ID}"),
        format!("{KMS_ARN_PREFIX}{KMS_ALIAS}"),
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static INVALID_AMI_NAME_CHARS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9()\[\] ./\-'@_]").ok());

/// Minimum AMI name length.
pub const AMI_NAME_MIN: usize = 3;
/// Maximum AMI name length.
pub const AMI_NAME_MAX: usize = 128;

/// The only accepted non-empty `imds_support` value.
pub const IMDS_V2: &str = "v2.0";

/// Accepts a key id, a multi-region key id, an alias, or the ARN of any of those.
#[must_use]
pub fn validate_kms_key(key: &str) -> bool {
    KMS_PATTERNS.iter().any(|re| re.is_match(key))
}

/// Replaces every character not allowed in an AMI name with `-`.
#[must_use]
pub fn clean_resource_name(name: &str) -> String {
    INVALID_AMI_NAME_CHARS
        .as_ref()
        .map_or_else(|| name.to_string(), |re| re.replace_all(name, "-").into_owned())
}

/// Returns every problem with an AMI name.
#[must_use]
pub fn ami_name_errors(name: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if name.len() < AMI_NAME_MIN || name.len() > AMI_NAME_MAX {
        errors.push(format!(
            "ami_name must be between {AMI_NAME_MIN} and {AMI_NAME_MAX} characters long"
        ));
    }
    if clean_resource_name(name) != name {
        errors.push(
            "ami_name should only contain alphanumeric characters, parentheses (()), square \
             brackets ([]), spaces ( ), periods (.), slashes (/), dashes (-), single quotes ('), \
             at-signs (@), or underscores (_); use clean_resource_name to clean it"
                .to_string(),
        );
    }
    errors
}

/// Returns an error message unless `value` is empty or `v2.0`.
#[must_use]
pub fn imds_support_error(value: &str) -> Option<String> {
    (!value.is_empty() && value != IMDS_V2).then(|| {
        format!("the only valid imds_support values are {IMDS_V2:?} or the empty string")
    })
}

/// Returns true for an IPv4 or IPv6 CIDR block.
#[must_use]
pub fn is_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(_)) => prefix <= 32,
        Ok(std::net::IpAddr::V6(_)) => prefix <= 128,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kms_key_accepted_forms() {
        assert!(validate_kms_key("alias/my-key"));
        assert!(validate_kms_key("12345678-1234-1234-1234-123456789012"));
        assert!(validate_kms_key("mrk-1234abcd12ab34cd56ef1234567890ab"));
        assert!(validate_kms_key(
            "arn:aws:kms:us-east-1:123456789012:key/12345678-1234-1234-1234-123456789012"
        ));
        assert!(validate_kms_key("arn:aws:kms:us-east-1:123456789012:alias/my-key"));
        assert!(validate_kms_key(
            "arn:aws-us-gov:kms:us-gov-west-1:123456789012:key/12345678-1234-1234-1234-123456789012"
        ));
    }

    #[test]
    fn test_kms_key_rejected() {
        assert!(!validate_kms_key("not-a-key"));
        assert!(!validate_kms_key(""));
        assert!(!validate_kms_key("arn:aws:kms:us-east-1:12345:key/abc"));
    }

    #[test]
    fn test_ami_name_rules() {
        assert!(!ami_name_errors("ab").is_empty());
        assert!(!ami_name_errors(&"a".repeat(129)).is_empty());
        assert!(ami_name_errors(&"a".repeat(128)).is_empty());
        assert!(!ami_name_errors("bad#name").is_empty());
        assert!(ami_name_errors("My AMI (v1.0) [test]").is_empty());
        assert!(ami_name_errors("ops@team's/image_1").is_empty());
    }

    #[test]
    fn test_clean_resource_name() {
        assert_eq!(clean_resource_name("a#b:c"), "a-b-c");
        assert_eq!(clean_resource_name("fine name"), "fine name");
    }

    #[test]
    fn test_imds_support() {
        assert!(imds_support_error("").is_none());
        assert!(imds_support_error("v2.0").is_none());
        assert!(imds_support_error("v1").is_some());
    }

    #[test]
    fn test_cidr() {
        assert!(is_cidr("0.0.0.0/0"));
        assert!(is_cidr("10.0.0.0/16"));
        assert!(is_cidr("::/0"));
        assert!(!is_cidr("10.0.0.0/33"));
        assert!(!is_cidr("10.0.0.0"));
        assert!(!is_cidr("banana/8"));
    }
}
