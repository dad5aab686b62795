//! The document consumed by the fetch init containers.
//!
//! It is rendered as JSON into a content-addressed ConfigMap and mounted
//! read-only into both fetch stages.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to serialize the fetcher configuration"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("failed to parse the fetcher configuration"))]
    Parse { source: serde_json::Error },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FetchConfig {
    pub fetchers: Vec<Fetcher>,
}

impl FetchConfig {
    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).context(SerializeSnafu)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(raw).context(ParseSnafu)
    }

    pub fn git_fetchers(&self) -> impl Iterator<Item = &GitFetcher> {
        self.fetchers.iter().filter_map(|f| f.git_fetcher.as_ref())
    }

    pub fn obj_fetchers(&self) -> impl Iterator<Item = &ObjFetcher> {
        self.fetchers.iter().filter_map(|f| f.obj_fetcher.as_ref())
    }
}

/// One entry per additional data that has to be fetched before the build.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Fetcher {
    #[serde(rename = "gitfetcher", default, skip_serializing_if = "Option::is_none")]
    pub git_fetcher: Option<GitFetcher>,

    #[serde(rename = "objfetcher", default, skip_serializing_if = "Option::is_none")]
    pub obj_fetcher: Option<ObjFetcher>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitFetcher {
    pub mount_point: String,
    /// Empty if the repository is fetched anonymously.
    pub credentials_path: String,
    pub repository: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjFetcher {
    pub mount_point: String,
    pub credentials_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_path: Option<String>,
    #[serde(default)]
    pub keys: BTreeMap<String, File>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct File {
    pub path: String,
    pub mode: i32,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_wire_format() {
        let config = FetchConfig {
            fetchers: vec![
                Fetcher {
                    git_fetcher: Some(GitFetcher {
                        mount_point: "/src".to_string(),
                        credentials_path: String::new(),
                        repository: "https://example.com/repo.git".to_string(),
                        reference: "main".to_string(),
                    }),
                    obj_fetcher: None,
                },
                Fetcher {
                    git_fetcher: None,
                    obj_fetcher: Some(ObjFetcher {
                        mount_point: "/firmware".to_string(),
                        credentials_path: "/etc/objfetcher/creds/BucketInfo.json".to_string(),
                        keys_path: None,
                        keys: BTreeMap::from([(
                            "blobs/fw.bin".to_string(),
                            File {
                                path: "fw.bin".to_string(),
                                mode: 0o755,
                            },
                        )]),
                    }),
                },
            ],
        };

        let expected: serde_json::Value = serde_json::from_str(indoc! {r#"
            {
              "fetchers": [
                {
                  "gitfetcher": {
                    "mountPoint": "/src",
                    "credentialsPath": "",
                    "repository": "https://example.com/repo.git",
                    "ref": "main"
                  }
                },
                {
                  "objfetcher": {
                    "mountPoint": "/firmware",
                    "credentialsPath": "/etc/objfetcher/creds/BucketInfo.json",
                    "keys": {
                      "blobs/fw.bin": { "path": "fw.bin", "mode": 493 }
                    }
                  }
                }
              ]
            }
        "#})
        .unwrap();

        let rendered: serde_json::Value =
            serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let mut keys = BTreeMap::new();
        for key in ["z", "a", "m"] {
            keys.insert(
                key.to_string(),
                File {
                    path: key.to_string(),
                    mode: 0o644,
                },
            );
        }
        let config = FetchConfig {
            fetchers: vec![Fetcher {
                git_fetcher: None,
                obj_fetcher: Some(ObjFetcher {
                    mount_point: "/data".to_string(),
                    credentials_path: "/creds".to_string(),
                    keys_path: Some("/keys".to_string()),
                    keys,
                }),
            }],
        };

        assert_eq!(config.to_json().unwrap(), config.clone().to_json().unwrap());
        assert!(config.to_json().unwrap().contains(r#""keys":{"a""#));
    }

    #[test]
    fn test_parse_splits_stages() {
        let config = FetchConfig::from_slice(
            indoc! {r#"
                {
                  "fetchers": [
                    { "objfetcher": { "mountPoint": "/a", "credentialsPath": "/c", "keysPath": "/k" } },
                    { "gitfetcher": { "mountPoint": "/src", "credentialsPath": "", "repository": "r", "ref": "v1" } },
                    { "objfetcher": { "mountPoint": "/b", "credentialsPath": "/c", "keys": {} } }
                  ]
                }
            "#}
            .as_bytes(),
        )
        .unwrap();

        assert_eq!(
            config
                .obj_fetchers()
                .map(|f| f.mount_point.as_str())
                .collect::<Vec<_>>(),
            vec!["/a", "/b"]
        );
        assert_eq!(config.obj_fetchers().next().unwrap().keys_path.as_deref(), Some("/k"));
        assert_eq!(config.git_fetchers().count(), 1);
        assert!(FetchConfig::from_slice(b"{").is_err());
    }
}
