//! Durable key-value state shared by every execution context.
//!
//! Each field lives in its own file under the prefs directory so writes to
//! different fields never contend, and each write lands through a rename so a
//! reader in another process sees either the old or the new value. There is no
//! cross-field transaction; concurrent writers to one field resolve
//! last-write-wins.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::error::StoreError;

/// Payload template used until the user sets one
pub const DEFAULT_PAYLOAD_TEMPLATE: &str = r#"{
  "message_body": "{{body}}",
  "message_from": "{{from}}",
  "message_date": "{{date}}"
}"#;

/// Retry queue value used until a context persists one
pub const EMPTY_RETRY_QUEUE: &str = "[]";

/// Individually addressable configuration fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Reception,
    Endpoint,
    SmsEnabled,
    AllowedPackages,
    PayloadTemplate,
    RetryQueue,
    ServiceRunning,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Reception,
        Field::Endpoint,
        Field::SmsEnabled,
        Field::AllowedPackages,
        Field::PayloadTemplate,
        Field::RetryQueue,
        Field::ServiceRunning,
    ];

    /// Storage key, also the file name
    pub fn key(self) -> &'static str {
        match self {
            Field::Reception => "reception",
            Field::Endpoint => "endpoint",
            Field::SmsEnabled => "sms_enabled",
            Field::AllowedPackages => "allowed_packages",
            Field::PayloadTemplate => "payload_template",
            Field::RetryQueue => "retry_queue",
            Field::ServiceRunning => "service_running",
        }
    }

    pub fn from_key(key: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.key() == key)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Handle to the on-disk store. Cheap to clone; holds no open files.
#[derive(Debug, Clone)]
pub struct DurableStore {
    dir: PathBuf,
}

impl DurableStore {
    /// Open a store rooted at `dir`. The directory is created lazily on the
    /// first write.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn field_path(&self, field: Field) -> PathBuf {
        self.dir.join(format!("{}.json", field.key()))
    }

    /// Read a field, distinguishing "never set" from failure
    pub fn try_get<T: DeserializeOwned>(&self, field: Field) -> Result<Option<T>, StoreError> {
        let path = self.field_path(field);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("reading field", &path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                field: field.key(),
                path,
                source,
            })
    }

    /// Write a field atomically
    pub fn try_set<T: Serialize + ?Sized>(&self, field: Field, value: &T) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(value).map_err(|source| StoreError::Encode {
            field: field.key(),
            source,
        })?;
        write_atomic(&self.field_path(field), &encoded)
    }

    /// Remove a field so its getter falls back to the default
    pub fn try_reset(&self, field: Field) -> Result<(), StoreError> {
        let path = self.field_path(field);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("removing field", &path, e)),
        }
    }

    fn get_or<T: DeserializeOwned>(&self, field: Field, default: T) -> T {
        match self.try_get(field) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                tracing::warn!(field = %field, error = %e, "store read failed, using default");
                default
            }
        }
    }

    fn set<T: Serialize + ?Sized>(&self, field: Field, value: &T) {
        if let Err(e) = self.try_set(field, value) {
            tracing::warn!(field = %field, error = %e, "store write failed");
        }
    }

    pub fn reception_filter(&self) -> String {
        self.get_or(Field::Reception, String::new())
    }

    pub fn set_reception_filter(&self, value: &str) {
        self.set(Field::Reception, value);
    }

    pub fn endpoint_url(&self) -> String {
        self.get_or(Field::Endpoint, String::new())
    }

    pub fn set_endpoint_url(&self, value: &str) {
        self.set(Field::Endpoint, value);
    }

    pub fn sms_capture_enabled(&self) -> bool {
        self.get_or(Field::SmsEnabled, true)
    }

    pub fn set_sms_capture_enabled(&self, value: bool) {
        self.set(Field::SmsEnabled, &value);
    }

    pub fn allowed_packages(&self) -> BTreeSet<String> {
        self.get_or(Field::AllowedPackages, BTreeSet::new())
    }

    pub fn set_allowed_packages<I>(&self, packages: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let set: BTreeSet<String> = packages.into_iter().map(Into::into).collect();
        self.set(Field::AllowedPackages, &set);
    }

    pub fn payload_template(&self) -> String {
        self.get_or(Field::PayloadTemplate, DEFAULT_PAYLOAD_TEMPLATE.to_string())
    }

    pub fn set_payload_template(&self, value: &str) {
        self.set(Field::PayloadTemplate, value);
    }

    /// Serialized retry queue owned by the delivering context. Stored opaquely.
    pub fn retry_queue(&self) -> String {
        self.get_or(Field::RetryQueue, EMPTY_RETRY_QUEUE.to_string())
    }

    pub fn set_retry_queue(&self, value: &str) {
        self.set(Field::RetryQueue, value);
    }

    pub fn is_running(&self) -> bool {
        self.get_or(Field::ServiceRunning, false)
    }

    pub fn set_running(&self, value: bool) {
        self.set(Field::ServiceRunning, &value);
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `bytes` via a sibling temp file and a rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StoreError::io("creating directory", parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    fs::write(&tmp, bytes).map_err(|e| StoreError::io("writing temp file", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io("replacing file", path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, DurableStore) {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = DurableStore::open(dir.path().join("prefs"));
        (dir, store)
    }

    mod defaults {
        use super::*;

        #[test]
        fn test_unset_fields_return_defaults() {
            let (_dir, store) = store();
            assert_eq!(store.reception_filter(), "");
            assert_eq!(store.endpoint_url(), "");
            assert!(store.sms_capture_enabled());
            assert!(store.allowed_packages().is_empty());
            assert_eq!(store.retry_queue(), "[]");
            assert!(!store.is_running());
        }

        #[test]
        fn test_default_payload_template_has_three_placeholders() {
            let (_dir, store) = store();
            let template = store.payload_template();
            assert_eq!(template, DEFAULT_PAYLOAD_TEMPLATE);
            assert!(template.contains("{{body}}"));
            assert!(template.contains("{{from}}"));
            assert!(template.contains("{{date}}"));

            let parsed: serde_json::Value =
                serde_json::from_str(&template).expect("template should be JSON");
            assert_eq!(parsed.as_object().map(|o| o.len()), Some(3));
        }

        #[test]
        fn test_corrupt_field_falls_back_to_default() {
            let (_dir, store) = store();
            fs::create_dir_all(store.dir()).unwrap();
            fs::write(store.dir().join("sms_enabled.json"), "not json").unwrap();

            assert!(store.sms_capture_enabled());
            assert!(matches!(
                store.try_get::<bool>(Field::SmsEnabled),
                Err(StoreError::Decode { field: "sms_enabled", .. })
            ));
        }

        #[test]
        fn test_unwritable_dir_swallows_write() {
            let dir = tempfile::tempdir().unwrap();
            let blocker = dir.path().join("blocker");
            fs::write(&blocker, "file, not a directory").unwrap();
            let store = DurableStore::open(blocker.join("prefs"));

            store.set_running(true);
            assert!(!store.is_running());
        }
    }

    mod fields {
        use super::*;

        #[test]
        fn test_set_then_get() {
            let (_dir, store) = store();
            store.set_reception_filter("bank");
            store.set_endpoint_url("https://relay.example/hook");
            store.set_sms_capture_enabled(false);
            store.set_payload_template("{\"b\":\"{{body}}\"}");
            store.set_retry_queue("[{\"id\":1}]");
            store.set_running(true);

            assert_eq!(store.reception_filter(), "bank");
            assert_eq!(store.endpoint_url(), "https://relay.example/hook");
            assert!(!store.sms_capture_enabled());
            assert_eq!(store.payload_template(), "{\"b\":\"{{body}}\"}");
            assert_eq!(store.retry_queue(), "[{\"id\":1}]");
            assert!(store.is_running());
        }

        #[test]
        fn test_allowed_packages_deduplicate() {
            let (_dir, store) = store();
            store.set_allowed_packages(["com.b", "com.a", "com.b"]);
            let packages: Vec<_> = store.allowed_packages().into_iter().collect();
            assert_eq!(packages, vec!["com.a".to_string(), "com.b".to_string()]);
        }

        #[test]
        fn test_last_write_wins_across_handles() {
            let (_dir, store) = store();
            let other = DurableStore::open(store.dir());
            store.set_endpoint_url("first");
            other.set_endpoint_url("second");
            assert_eq!(store.endpoint_url(), "second");
        }

        #[test]
        fn test_fields_are_independent() {
            let (_dir, store) = store();
            store.set_running(true);
            store.try_reset(Field::Reception).unwrap();
            assert!(store.is_running());
            store.try_reset(Field::ServiceRunning).unwrap();
            assert!(!store.is_running());
        }

        #[test]
        fn test_field_keys_round_trip() {
            for field in Field::ALL {
                assert_eq!(Field::from_key(field.key()), Some(field));
            }
            assert_eq!(Field::from_key("nope"), None);
        }

        #[test]
        fn test_no_temp_files_left_behind() {
            let (_dir, store) = store();
            store.set_endpoint_url("x");
            store.set_endpoint_url("y");
            let leftovers = fs::read_dir(store.dir())
                .unwrap()
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                .count();
            assert_eq!(leftovers, 0);
        }
    }
}
