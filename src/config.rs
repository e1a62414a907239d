// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Persistent key/value configuration documents.
//!
//! Every persistent component (the device manager, each sensor) owns one
//! named JSON document under the store's root directory. Documents are flat,
//! carry a mandatory `version` integer and are re-written after every
//! successful settings change. Unknown keys are ignored on load; a version
//! mismatch falls back to defaults with a warning.

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

use crate::{Error, Result};

/// Loads and saves the named configuration documents of one service
/// instance. Cloning is cheap; clones share the same root directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ConfigStore { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn document_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    /// Load a document. Returns `None` when the file is missing, unreadable,
    /// malformed, or carries a version other than `expected_version`; the
    /// caller is expected to fall back to its defaults.
    pub fn load<T: DeserializeOwned>(&self, name: &str, expected_version: u32) -> Option<T> {
        let path = self.document_path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                debug!("No config document at {:?}, using defaults", path);
                return None;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                warn!("Config document {:?} is malformed ({}), using defaults", path, err);
                return None;
            }
        };

        let version = value.get("version").and_then(|v| v.as_u64());
        if version != Some(expected_version as u64) {
            warn!(
                "Config {:?} version {:?} does not match expected version {}, using defaults",
                name, version, expected_version
            );
            return None;
        }

        match serde_json::from_value(value) {
            Ok(document) => Some(document),
            Err(err) => {
                warn!("Config document {:?} failed to parse ({}), using defaults", path, err);
                None
            }
        }
    }

    /// Write a document, creating the store directory on first use.
    pub fn save<T: Serialize>(&self, name: &str, document: &T) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|err| Error::Config(format!("creating {:?}: {}", self.root, err)))?;

        let path = self.document_path(name);
        let text = serde_json::to_string_pretty(document)
            .map_err(|err| Error::Config(format!("serializing {:?}: {}", name, err)))?;
        fs::write(&path, text)
            .map_err(|err| Error::Config(format!("writing {:?}: {}", path, err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempdir::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct TestConfig {
        version: u32,
        interval: u32,
        enabled: bool,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                version: 2,
                interval: 1000,
                enabled: true,
            }
        }
    }

    #[test]
    fn round_trips_documents() {
        let dir = TempDir::new("pulseplug-config").unwrap();
        let store = ConfigStore::new(dir.path());

        let config = TestConfig {
            version: 2,
            interval: 250,
            enabled: false,
        };
        store.save("test", &config).unwrap();
        let loaded: TestConfig = store.load("test", 2).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_document_yields_none() {
        let dir = TempDir::new("pulseplug-config").unwrap();
        let store = ConfigStore::new(dir.path());
        assert!(store.load::<TestConfig>("absent", 2).is_none());
    }

    #[test]
    fn version_mismatch_falls_back() {
        let dir = TempDir::new("pulseplug-config").unwrap();
        let store = ConfigStore::new(dir.path());

        let stale = TestConfig {
            version: 1,
            interval: 123,
            enabled: false,
        };
        store.save("test", &stale).unwrap();
        assert!(store.load::<TestConfig>("test", 2).is_none());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = TempDir::new("pulseplug-config").unwrap();
        let store = ConfigStore::new(dir.path());
        std::fs::write(
            dir.path().join("test.json"),
            r#"{ "version": 2, "interval": 42, "enabled": true, "surprise": "ignored" }"#,
        )
        .unwrap();

        let loaded: TestConfig = store.load("test", 2).unwrap();
        assert_eq!(loaded.interval, 42);
    }

    #[test]
    fn malformed_document_falls_back() {
        let dir = TempDir::new("pulseplug-config").unwrap();
        let store = ConfigStore::new(dir.path());
        std::fs::write(dir.path().join("test.json"), "{ not json").unwrap();
        assert!(store.load::<TestConfig>("test", 2).is_none());
    }
}
