//! Deterministic names for child resources and object store keys.
//!
//! Every generated name is a valid RFC 1123 label, so it can be used for
//! ConfigMaps, Volumes and object key segments alike.
use sha2::{Digest, Sha256};

/// Maximum length of an RFC 1123 label.
pub const MAX_NAME_LENGTH: usize = 63;

/// Number of hex characters of the content digest that end up in a name.
const DIGEST_LENGTH: usize = 16;

const PLACEHOLDER_INNER: char = '-';
const PLACEHOLDER_EDGE: char = 'a';

/// Returns `{logical}-{digest}` where `digest` is derived from `content`.
///
/// Identical content always yields the identical name, so a changed
/// configuration results in a new object instead of an in-place update.
pub fn content_addressed_name(logical: &str, content: &[u8]) -> String {
    let digest = content_digest(content);
    let prefix_budget = MAX_NAME_LENGTH - DIGEST_LENGTH - 1;
    let prefix: String = logical.chars().take(prefix_budget).collect();
    dns_name(&format!("{prefix}-{}", &digest[..DIGEST_LENGTH]))
}

/// Hex encoded SHA-256 of `content`.
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Name of an auxiliary Volume that belongs to the additional data `name`.
pub fn volume_name(name: &str, suffix: &str) -> String {
    content_addressed_name(&format!("{name}-{suffix}"), name.as_bytes())
}

/// Object store key for a build artifact.
pub fn object_key(namespace: &str, name: &str, format: &str, file: &str) -> String {
    [namespace, name, format, file]
        .iter()
        .map(|segment| dns_name(segment))
        .collect::<Vec<_>>()
        .join("/")
}

/// Maps `name` onto the RFC 1123 label alphabet.
///
/// A run of characters outside of `[a-z0-9]` is replaced by a single `-`, or by
/// a single `a` at the start or end of the name where a hyphen is not allowed.
pub fn dns_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut in_run = false;

    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if in_run {
                out.push(if out.is_empty() {
                    PLACEHOLDER_EDGE
                } else {
                    PLACEHOLDER_INNER
                });
                in_run = false;
            }
            out.push(c);
        } else {
            in_run = true;
        }
    }

    if in_run || out.is_empty() {
        out.push(PLACEHOLDER_EDGE);
    }

    truncate(&out)
}

fn truncate(name: &str) -> String {
    let mut truncated: String = name.chars().take(MAX_NAME_LENGTH).collect();
    if truncated.ends_with(PLACEHOLDER_INNER) {
        truncated.pop();
        truncated.push(PLACEHOLDER_EDGE);
    }
    truncated
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn is_rfc_1123_label(name: &str) -> bool {
        let bytes = name.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= MAX_NAME_LENGTH
            && bytes
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
            && bytes[0] != b'-'
            && bytes[bytes.len() - 1] != b'-'
    }

    #[rstest]
    #[case("simplest", "simplest")]
    #[case(
        "instance.with.dots-object-headless",
        "instance-with-dots-object-headless"
    )]
    #[case(
        "TestQueryDottedServiceName.With.Dots",
        "testquerydottedservicename-with-dots"
    )]
    #[case("Service🦄", "servicea")]
    #[case("📈Stock-Tracker", "astock-tracker")]
    #[case("-📈Stock-Tracker", "astock-tracker")]
    #[case("📈", "a")]
    #[case("foo-", "fooa")]
    #[case("-foo", "afoo")]
    #[case("kernel+initrd", "kernel-initrd")]
    #[case("a...b", "a-b")]
    #[case("", "a")]
    fn test_dns_name(#[case] input: &str, #[case] expected: &str) {
        let name = dns_name(input);
        assert_eq!(name, expected);
        assert!(is_rfc_1123_label(&name), "{name} is not a valid name");
    }

    #[test]
    fn test_dns_name_truncates_long_names() {
        let name = dns_name(&format!("{}.suffix", "x".repeat(61)));
        assert_eq!(name.len(), MAX_NAME_LENGTH);
        assert!(is_rfc_1123_label(&name), "{name} is not a valid name");
    }

    #[test]
    fn test_content_addressed_name_is_stable() {
        let first = content_addressed_name("cfg", b"hello");
        let second = content_addressed_name("cfg", b"hello");

        assert_eq!(first, second);
        assert!(first.starts_with("cfg-"));
        assert!(is_rfc_1123_label(&first), "{first} is not a valid name");
        assert_ne!(first, content_addressed_name("cfg", b"hello!"));
    }

    #[test]
    fn test_content_addressed_name_keeps_digest_for_long_prefixes() {
        let long = "image".repeat(20);
        let a = content_addressed_name(&long, b"a: 1");
        let b = content_addressed_name(&long, b"a: 2");

        assert_eq!(a.len(), MAX_NAME_LENGTH);
        assert_ne!(a, b);
        assert!(is_rfc_1123_label(&a), "{a} is not a valid name");
    }

    #[test]
    fn test_volume_name() {
        let name = volume_name("firmware", "objcreds");
        assert!(name.starts_with("firmware-objcreds-"));
        assert_eq!(name, volume_name("firmware", "objcreds"));
        assert_ne!(name, volume_name("firmware", "items"));
    }

    #[rstest]
    #[case("aws", "test/test-image/aws/stdin")]
    #[case("iso-efi", "test/test-image/iso-efi/stdin")]
    #[case("kernel+initrd", "test/test-image/kernel-initrd/stdin")]
    #[case("kernel+squashfs", "test/test-image/kernel-squashfs/stdin")]
    #[case("tar-kernel-initrd", "test/test-image/tar-kernel-initrd/stdin")]
    #[case("", "test/test-image/a/stdin")]
    fn test_object_key(#[case] format: &str, #[case] expected: &str) {
        assert_eq!(object_key("test", "test-image", format, "stdin"), expected);
    }
}
