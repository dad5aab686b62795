//! The record of uploaded build artifacts.
//!
//! It maps every object key to a presigned download URL and is stored in the
//! result Secret. Finalization reads it back to know which objects to delete.
//! A key with an empty URL belongs to an upload that was started but never
//! confirmed, the object may or may not exist.
use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::{ByteString, api::core::v1::Secret};

use crate::crd::OUTPUT_RECORD_KEY;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to parse the output record"))]
    Parse { source: serde_json::Error },

    #[snafu(display("failed to serialize the output record"))]
    Serialize { source: serde_json::Error },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputRecord {
    objects: BTreeMap<String, String>,
}

impl OutputRecord {
    /// Reads the record from a result Secret. A Secret without the record key
    /// yields an empty record.
    pub fn from_secret(secret: &Secret) -> Result<Self, Error> {
        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get(OUTPUT_RECORD_KEY))
            .map(|value| value.0.clone())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|data| data.get(OUTPUT_RECORD_KEY))
                    .map(|value| value.as_bytes().to_vec())
            });

        match raw {
            Some(raw) if !raw.is_empty() => Ok(Self {
                objects: serde_json::from_slice(&raw).context(ParseSnafu)?,
            }),
            _ => Ok(Self::default()),
        }
    }

    /// The Secret data holding this record.
    pub fn to_secret_data(&self) -> Result<BTreeMap<String, ByteString>, Error> {
        let raw = serde_json::to_vec(&self.objects).context(SerializeSnafu)?;
        Ok(BTreeMap::from([(
            OUTPUT_RECORD_KEY.to_string(),
            ByteString(raw),
        )]))
    }

    pub fn insert(&mut self, key: impl Into<String>, url: impl Into<String>) {
        self.objects.insert(key.into(), url.into());
    }

    /// Records `key` before its object is written.
    pub fn insert_pending(&mut self, key: impl Into<String>) {
        self.objects.insert(key.into(), String::new());
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.get(key).is_some_and(str::is_empty)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.objects.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_round_trip() {
        let mut record = OutputRecord::default();
        record.insert("ns/image/iso-efi/image-efi-iso", "https://s3.example.com/a?sig=1");
        record.insert("ns/image/iso-efi/image-efi-iso-sha256", "https://s3.example.com/b");

        let secret = Secret {
            data: Some(record.to_secret_data().unwrap()),
            ..Secret::default()
        };

        let read = OutputRecord::from_secret(&secret).unwrap();
        assert_eq!(read, record);
        assert_eq!(
            read.keys().collect::<Vec<_>>(),
            vec![
                "ns/image/iso-efi/image-efi-iso",
                "ns/image/iso-efi/image-efi-iso-sha256"
            ]
        );
    }

    #[test]
    fn test_missing_record_is_empty() {
        let record = OutputRecord::from_secret(&Secret::default()).unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn test_string_data_is_read() {
        let secret = Secret {
            string_data: Some(BTreeMap::from([(
                OUTPUT_RECORD_KEY.to_string(),
                r#"{"a/b/c/d":"https://example.com"}"#.to_string(),
            )])),
            ..Secret::default()
        };

        let record = OutputRecord::from_secret(&secret).unwrap();
        assert_eq!(record.get("a/b/c/d"), Some("https://example.com"));
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_pending_keys_survive_the_secret() {
        let mut record = OutputRecord::default();
        record.insert_pending("ns/image/tar/image-tar");

        let secret = Secret {
            data: Some(record.to_secret_data().unwrap()),
            ..Secret::default()
        };

        let read = OutputRecord::from_secret(&secret).unwrap();
        assert!(read.is_pending("ns/image/tar/image-tar"));
        assert_eq!(read.keys().collect::<Vec<_>>(), vec!["ns/image/tar/image-tar"]);

        let mut read = read;
        read.insert("ns/image/tar/image-tar", "https://example.com/image-tar");
        assert!(!read.is_pending("ns/image/tar/image-tar"));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                OUTPUT_RECORD_KEY.to_string(),
                ByteString(b"not json".to_vec()),
            )])),
            ..Secret::default()
        };

        assert!(OutputRecord::from_secret(&secret).is_err());
    }
}
