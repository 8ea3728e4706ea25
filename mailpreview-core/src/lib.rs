use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod bus;
pub mod registry;
pub mod session;
pub mod view;

pub use bus::EventBus;
pub use registry::{ApplyOutcome, FileRegistry};
pub use session::{Session, SessionEvent};
pub use view::ViewState;

pub const KEEPALIVE_TOKEN: &str = "KEEPALIVE";
pub const DEFAULT_TEMPLATE_PREFIX: &str = "DEV";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Milliseconds since the Unix epoch, as the backend reports file times.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown file {0}")]
    UnknownFile(FileId),
    #[error("file {id} is new but the change carries no `{field}`")]
    IncompleteRecord { id: FileId, field: &'static str },
    #[error("file id must not be empty")]
    EmptyFileId,
    #[error("decode error: {0}")]
    Decode(String),
}

/// Location of a dependency. Backends either describe it as an object that
/// carries its own modification time or as a bare path string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyPath {
    Described {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified: Option<Timestamp>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Plain(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<DependencyPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Timestamp>,
}

impl Dependency {
    pub fn at(modified: Timestamp) -> Self {
        Self {
            path: Some(DependencyPath::Described {
                modified: Some(modified),
                extra: Map::new(),
            }),
            modified: None,
        }
    }

    /// `path.modified` wins over the flat `modified` field.
    pub fn modified(&self) -> Option<Timestamp> {
        match &self.path {
            Some(DependencyPath::Described {
                modified: Some(modified),
                ..
            }) => Some(*modified),
            _ => self.modified,
        }
    }
}

/// External data file merged into a template at render time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Timestamp>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DataSource {
    pub fn at(modified: Timestamp) -> Self {
        Self {
            modified: Some(modified),
            extra: Map::new(),
        }
    }
}

/// One change notification as it arrives over the push channel (or one
/// entry of the bulk listing). Every field except `id` is optional; absent
/// fields leave the stored record untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdate {
    pub id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<Dependency>>,
    /// `None`: absent. `Some(None)`: explicitly cleared with `null`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Option<DataSource>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn deserialize_present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl FileUpdate {
    pub fn new(id: impl Into<FileId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn from_json(data: &str) -> Result<Self, CoreError> {
        serde_json::from_str::<Self>(data).map_err(|err| CoreError::Decode(err.to_string()))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice::<Self>(data).map_err(|err| CoreError::Decode(err.to_string()))
    }
}

/// A compiled template as the client knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub title: Option<String>,
    pub created: Timestamp,
    pub modified: Timestamp,
    pub dependencies: Vec<Dependency>,
    pub data: Option<DataSource>,
    pub errors: BTreeMap<String, String>,
    pub view_path: Option<String>,
    pub extra: Map<String, Value>,
    last_mod: Timestamp,
}

impl FileRecord {
    pub fn from_update(update: FileUpdate) -> Result<Self, CoreError> {
        if update.id.as_str().trim().is_empty() {
            return Err(CoreError::EmptyFileId);
        }
        let modified = update.modified.ok_or_else(|| CoreError::IncompleteRecord {
            id: update.id.clone(),
            field: "modified",
        })?;

        let mut record = Self {
            name: update
                .name
                .unwrap_or_else(|| update.id.as_str().to_owned()),
            id: update.id,
            title: update.title,
            created: update.created.unwrap_or(modified),
            modified,
            dependencies: update.dependencies.unwrap_or_default(),
            data: update.data.flatten(),
            errors: update.errors.unwrap_or_default(),
            view_path: update.view_path,
            extra: update.extra,
            last_mod: modified,
        };
        record.refresh_last_mod();
        Ok(record)
    }

    /// Shallow merge: every field present in `update` replaces the stored one.
    pub fn merge(&mut self, update: FileUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(title) = update.title {
            self.title = Some(title);
        }
        if let Some(created) = update.created {
            self.created = created;
        }
        if let Some(modified) = update.modified {
            self.modified = modified;
        }
        if let Some(dependencies) = update.dependencies {
            self.dependencies = dependencies;
        }
        if let Some(data) = update.data {
            self.data = data;
        }
        if let Some(errors) = update.errors {
            self.errors = errors;
        }
        if let Some(view_path) = update.view_path {
            self.view_path = Some(view_path);
        }
        self.extra.extend(update.extra);
        self.refresh_last_mod();
    }

    pub fn last_mod(&self) -> Timestamp {
        self.last_mod
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn refresh_last_mod(&mut self) {
        self.last_mod = newest_modification(self.modified, &self.dependencies, self.data.as_ref());
    }
}

/// Newest of the file's own time, its dependencies and its data source.
pub fn newest_modification(
    modified: Timestamp,
    dependencies: &[Dependency],
    data: Option<&DataSource>,
) -> Timestamp {
    let newest_dependency = dependencies.iter().filter_map(Dependency::modified).max();

    let candidate = match newest_dependency {
        Some(dep_max) if dep_max >= modified => dep_max,
        _ => modified,
    };

    match data.and_then(|data| data.modified) {
        Some(data_modified) if data_modified >= candidate => data_modified,
        _ => candidate,
    }
}

/// Ordering used for the template list: case-insensitive first so that
/// `alpha` sorts next to `Alpha`, ordinal second to keep it total.
pub fn compare_names(a: &str, b: &str) -> std::cmp::Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn no_dependencies_and_no_data_keeps_own_time() {
        for millis in [0, 1, 100, 1_735_000_000_000] {
            assert_eq!(newest_modification(ts(millis), &[], None), ts(millis));
        }
    }

    #[test]
    fn newest_dependency_dominates() {
        let deps = vec![Dependency::at(ts(150)), Dependency::at(ts(120))];
        assert_eq!(newest_modification(ts(100), &deps, None), ts(150));

        let older = vec![Dependency::at(ts(50)), Dependency::at(ts(20))];
        assert_eq!(newest_modification(ts(100), &older, None), ts(100));
    }

    #[test]
    fn dependency_comparison_is_numeric() {
        // Lexically "900" > "1000"; numerically it is not.
        let deps = vec![Dependency::at(ts(900)), Dependency::at(ts(1000))];
        assert_eq!(newest_modification(ts(10), &deps, None), ts(1000));
    }

    #[test]
    fn data_source_overrides_when_newer() {
        let deps = vec![Dependency::at(ts(150))];
        let data = DataSource::at(ts(400));
        assert_eq!(newest_modification(ts(100), &deps, Some(&data)), ts(400));

        let stale = DataSource::at(ts(10));
        assert_eq!(newest_modification(ts(100), &deps, Some(&stale)), ts(150));
    }

    #[test]
    fn data_source_counts_without_dependencies() {
        let data = DataSource::at(ts(250));
        assert_eq!(newest_modification(ts(100), &[], Some(&data)), ts(250));
    }

    #[test]
    fn dependency_without_time_is_ignored() {
        let deps = vec![Dependency {
            path: Some(DependencyPath::Plain("partials/header.html".to_owned())),
            modified: None,
        }];
        assert_eq!(newest_modification(ts(100), &deps, None), ts(100));
    }

    #[test]
    fn decodes_backend_payload() {
        let json = r#"{
            "id": "3f2c",
            "name": "welcome.html",
            "created": 10,
            "modified": 100,
            "dependencies": [
                {"path": {"name": "base.css", "modified": 300}},
                {"path": "partials/footer.html", "modified": 200}
            ],
            "data": {"modified": 250},
            "errors": {},
            "viewPath": "/api/files/3f2c",
            "size": 2048
        }"#;

        let update = FileUpdate::from_json(json).unwrap();
        assert_eq!(update.view_path.as_deref(), Some("/api/files/3f2c"));
        assert_eq!(update.extra.get("size"), Some(&Value::from(2048)));

        let record = FileRecord::from_update(update).unwrap();
        assert_eq!(record.dependencies[0].modified(), Some(ts(300)));
        assert_eq!(record.dependencies[1].modified(), Some(ts(200)));
        assert_eq!(record.last_mod(), ts(300));
        assert!(!record.has_errors());
    }

    #[test]
    fn null_data_differs_from_absent_data() {
        let cleared = FileUpdate::from_json(r#"{"id":"a","data":null}"#).unwrap();
        assert_eq!(cleared.data, Some(None));

        let absent = FileUpdate::from_json(r#"{"id":"a"}"#).unwrap();
        assert_eq!(absent.data, None);
    }

    #[test]
    fn new_record_requires_modified() {
        let err = FileRecord::from_update(FileUpdate::new("a")).unwrap_err();
        assert_eq!(
            err,
            CoreError::IncompleteRecord {
                id: FileId::new("a"),
                field: "modified",
            }
        );
    }

    #[test]
    fn merge_overwrites_present_fields_only() {
        let mut update = FileUpdate::new("a");
        update.name = Some("a.html".to_owned());
        update.modified = Some(ts(100));
        update.errors = Some(BTreeMap::from([("css".to_owned(), "bad".to_owned())]));
        let mut record = FileRecord::from_update(update).unwrap();
        assert!(record.has_errors());

        let mut change = FileUpdate::new("a");
        change.modified = Some(ts(300));
        record.merge(change);

        assert_eq!(record.name, "a.html");
        assert_eq!(record.modified, ts(300));
        assert_eq!(record.last_mod(), ts(300));
        assert!(record.has_errors());
    }

    #[test]
    fn names_sort_case_insensitively() {
        let mut names = vec!["beta", "Alpha", "alpha", "Gamma"];
        names.sort_by(|a, b| compare_names(a, b));
        assert_eq!(names, vec!["Alpha", "alpha", "beta", "Gamma"]);
    }
}
