//! Built-in record types of the thesis-management data set.
//!
//! Each type carries the fields the application reads and writes plus an
//! `extra` bucket holding everything else verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::store::{Extra, ReadOutcome, Record, RecordKey, RecordStore, StoreError};

const fn default_true() -> bool {
    true
}

const fn default_supervise_capacity() -> u32 {
    5
}

const fn default_judge_capacity() -> u32 {
    10
}

fn default_thesis_status() -> String {
    "pending".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// People and courses
// ─────────────────────────────────────────────────────────────────────────────

/// A registered student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub student_code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Student {
    const COLLECTION: &'static str = "students";
    const KEY_FIELDS: &'static [&'static str] = &["student_code"];

    fn key(&self) -> RecordKey {
        RecordKey::single(&self.student_code)
    }
}

/// A registered teacher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Teacher {
    pub teacher_code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub email: String,
    /// Maximum concurrent supervisions.
    #[serde(default = "default_supervise_capacity")]
    pub capacity_supervise: u32,
    /// Maximum concurrent judging assignments.
    #[serde(default = "default_judge_capacity")]
    pub capacity_judge: u32,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Teacher {
    const COLLECTION: &'static str = "teachers";
    const KEY_FIELDS: &'static [&'static str] = &["teacher_code"];

    fn key(&self) -> RecordKey {
        RecordKey::single(&self.teacher_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub course_id: String,
    /// Stored as `course_title`; a plain `title` is accepted on read.
    #[serde(default, rename = "course_title", alias = "title")]
    pub title: String,
    #[serde(default)]
    pub teacher_code: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub semester: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Course {
    const COLLECTION: &'static str = "courses";
    const KEY_FIELDS: &'static [&'static str] = &["course_id"];

    fn key(&self) -> RecordKey {
        RecordKey::single(&self.course_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Theses
// ─────────────────────────────────────────────────────────────────────────────

/// A thesis request, keyed by student and course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thesis {
    pub student_code: String,
    pub course_id: String,
    #[serde(default = "default_thesis_status")]
    pub status: String,
    #[serde(default)]
    pub request_date: Option<String>,
    #[serde(default)]
    pub approval_date: Option<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// File role (e.g. `pdf`, `cover`) to ingest descriptor or stored path.
    #[serde(default)]
    pub files: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Thesis {
    const COLLECTION: &'static str = "theses";
    const KEY_FIELDS: &'static [&'static str] = &["student_code", "course_id"];

    fn key(&self) -> RecordKey {
        RecordKey::composite([self.student_code.as_str(), self.course_id.as_str()])
    }
}

/// Judge assignment of a defense.
///
/// Older archives stored judges as a list of codes or a list of
/// `{role, code}` objects; both are read into this shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Judges {
    pub internal: String,
    pub external: String,
}

impl<'de> Deserialize<'de> for Judges {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_legacy(&Value::deserialize(deserializer)?))
    }
}

impl Judges {
    /// Normalize any historical judges encoding. Unrecognized shapes yield
    /// empty codes.
    #[must_use]
    pub fn from_legacy(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self {
                internal: map.get("internal").map(code_string).unwrap_or_default(),
                external: map.get("external").map(code_string).unwrap_or_default(),
            },
            Value::Array(items) if items.first().is_some_and(Value::is_object) => {
                let mut judges = Self::default();
                for item in items {
                    let role = item
                        .get("role")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_ascii_lowercase();
                    let code = item.get("code").map(code_string).unwrap_or_default();
                    match role.as_str() {
                        "internal" => judges.internal = code,
                        "external" => judges.external = code,
                        _ => {},
                    }
                }
                judges
            },
            Value::Array(items)
                if items.len() >= 2
                    && items[..2].iter().all(|v| v.is_string() || v.is_number()) =>
            {
                Self {
                    internal: code_string(&items[0]),
                    external: code_string(&items[1]),
                }
            },
            _ => Self::default(),
        }
    }
}

fn code_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default)]
    pub supervisor: f64,
    #[serde(default)]
    pub internal: f64,
    #[serde(default)]
    pub external: f64,
}

/// Terminal archive entry for a defended thesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefendedThesis {
    pub student_code: String,
    pub course_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub semester: String,
    #[serde(default)]
    pub supervisor: String,
    #[serde(default)]
    pub judges: Judges,
    #[serde(default)]
    pub scores: Scores,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub grade_letter: Option<String>,
    #[serde(default)]
    pub attendees: Vec<String>,
    #[serde(default)]
    pub files: BTreeMap<String, Value>,
    #[serde(default)]
    pub finalized_at: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for DefendedThesis {
    const COLLECTION: &'static str = "defended_theses";
    const KEY_FIELDS: &'static [&'static str] = &["student_code", "course_id"];

    fn key(&self) -> RecordKey {
        RecordKey::composite([self.student_code.as_str(), self.course_id.as_str()])
    }
}

impl DefendedThesis {
    /// Start an archive entry from an approved thesis request. Title,
    /// abstract-derived fields and files carry over; scoring is left to the
    /// caller.
    #[must_use]
    pub fn from_thesis(thesis: &Thesis) -> Self {
        let mut extra = Extra::new();
        if let Some(text) = &thesis.abstract_text {
            extra.insert("abstract".to_string(), Value::String(text.clone()));
        }
        if !thesis.keywords.is_empty() {
            extra.insert(
                "keywords".to_string(),
                Value::from(thesis.keywords.clone()),
            );
        }
        let title = thesis
            .extra
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            student_code: thesis.student_code.clone(),
            course_id: thesis.course_id.clone(),
            title,
            year: None,
            semester: String::new(),
            supervisor: String::new(),
            judges: Judges::default(),
            scores: Scores::default(),
            score: 0.0,
            grade_letter: None,
            attendees: Vec::new(),
            files: thesis.files.clone(),
            finalized_at: Some(crate::time::now_rfc3339()),
            extra,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dynamic access
// ─────────────────────────────────────────────────────────────────────────────

/// The built-in collections, for callers that pick one at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Students,
    Teachers,
    Courses,
    Theses,
    DefendedTheses,
}

impl CollectionKind {
    pub const ALL: [Self; 5] = [
        Self::Students,
        Self::Teachers,
        Self::Courses,
        Self::Theses,
        Self::DefendedTheses,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Students => Student::COLLECTION,
            Self::Teachers => Teacher::COLLECTION,
            Self::Courses => Course::COLLECTION,
            Self::Theses => Thesis::COLLECTION,
            Self::DefendedTheses => DefendedThesis::COLLECTION,
        }
    }

    /// Read the whole collection into tagged records.
    pub fn load(self, store: &RecordStore) -> Result<Vec<AnyRecord>, StoreError> {
        fn wrap<R: Record>(
            store: &RecordStore,
            tag: fn(R) -> AnyRecord,
        ) -> Result<Vec<AnyRecord>, StoreError> {
            Ok(store.read_collection::<R>()?.into_iter().map(tag).collect())
        }
        match self {
            Self::Students => wrap(store, AnyRecord::Student),
            Self::Teachers => wrap(store, AnyRecord::Teacher),
            Self::Courses => wrap(store, AnyRecord::Course),
            Self::Theses => wrap(store, AnyRecord::Thesis),
            Self::DefendedTheses => wrap(store, AnyRecord::DefendedThesis),
        }
    }

    /// Read the collection, restoring it from a snapshot if the current file
    /// does not parse, and report which happened.
    pub fn verify(self, store: &RecordStore) -> Result<ReadOutcome, StoreError> {
        fn outcome<R: Record>(store: &RecordStore) -> Result<ReadOutcome, StoreError> {
            Ok(store.read_collection_with_outcome::<R>()?.outcome)
        }
        match self {
            Self::Students => outcome::<Student>(store),
            Self::Teachers => outcome::<Teacher>(store),
            Self::Courses => outcome::<Course>(store),
            Self::Theses => outcome::<Thesis>(store),
            Self::DefendedTheses => outcome::<DefendedThesis>(store),
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CollectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown collection {s:?}"))
    }
}

/// A record of any built-in collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnyRecord {
    Student(Student),
    Teacher(Teacher),
    Course(Course),
    Thesis(Thesis),
    DefendedThesis(DefendedThesis),
}

impl AnyRecord {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Student(r) => r.key(),
            Self::Teacher(r) => r.key(),
            Self::Course(r) => r.key(),
            Self::Thesis(r) => r.key(),
            Self::DefendedThesis(r) => r.key(),
        }
    }
}
