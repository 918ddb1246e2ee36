//! Exported object types
//!
//! Every object type knows how to repair a raw journal record into its
//! canonical form and how to derive the identity digest used to deduplicate
//! it. Adding an object type means adding a variant and its identity function.

use chrono::{DateTime, Utc};
use jex_common::digest::{sha256, NodeId};
use jex_common::{JexError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of object carried by a journal topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Origin,
    OriginVisit,
    OriginVisitStatus,
    Content,
    SkippedContent,
    Directory,
    Revision,
    Release,
    Snapshot,
}

/// Width of a git object hash
const GIT_HASH_LEN: usize = 20;

/// Identity derivation: `Ok(None)` means the object is deliberately not exported
type IdentityFn = fn(ObjectType, &Value) -> Result<Option<NodeId>>;

impl ObjectType {
    pub const ALL: [ObjectType; 9] = [
        ObjectType::Origin,
        ObjectType::OriginVisit,
        ObjectType::OriginVisitStatus,
        ObjectType::Content,
        ObjectType::SkippedContent,
        ObjectType::Directory,
        ObjectType::Revision,
        ObjectType::Release,
        ObjectType::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Origin => "origin",
            ObjectType::OriginVisit => "origin_visit",
            ObjectType::OriginVisitStatus => "origin_visit_status",
            ObjectType::Content => "content",
            ObjectType::SkippedContent => "skipped_content",
            ObjectType::Directory => "directory",
            ObjectType::Revision => "revision",
            ObjectType::Release => "release",
            ObjectType::Snapshot => "snapshot",
        }
    }

    fn identity_fn(self) -> IdentityFn {
        match self {
            ObjectType::Origin => origin_identity,
            ObjectType::OriginVisit => origin_visit_identity,
            ObjectType::OriginVisitStatus => origin_visit_status_identity,
            ObjectType::Content | ObjectType::SkippedContent => content_identity,
            ObjectType::Directory
            | ObjectType::Revision
            | ObjectType::Release
            | ObjectType::Snapshot => intrinsic_identity,
        }
    }

    /// Identity digest of a normalized object
    pub fn identity(self, object: &Value) -> Result<Option<NodeId>> {
        (self.identity_fn())(self, object)
    }

    /// Decode a raw message value and normalize it
    pub fn decode(self, raw: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(raw)?;
        self.normalize(value)
    }

    /// Repair legacy record shapes into the canonical form:
    /// `origin` given as `{"url": ...}` becomes the bare URL and numeric
    /// `date` timestamps become RFC 3339 strings.
    pub fn normalize(self, value: Value) -> Result<Value> {
        let Value::Object(mut map) = value else {
            return Err(JexError::invalid_object(self.as_str(), "record is not a JSON object"));
        };

        if let Some(Value::Object(origin)) = map.get("origin") {
            if let Some(url) = origin.get("url").cloned() {
                map.insert("origin".to_string(), url);
            }
        }

        if let Some(Value::Number(ts)) = map.get("date") {
            let date = ts
                .as_f64()
                .and_then(timestamp_to_datetime)
                .ok_or_else(|| JexError::invalid_object(self.as_str(), format!("bad date timestamp {}", ts)))?;
            map.insert("date".to_string(), Value::String(date.to_rfc3339()));
        }

        Ok(Value::Object(map))
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectType {
    type Err = JexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ObjectType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JexError::UnknownObjectType(s.to_string()))
    }
}

fn timestamp_to_datetime(ts: f64) -> Option<DateTime<Utc>> {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}

fn str_field<'a>(object_type: ObjectType, object: &'a Value, field: &str) -> Result<&'a str> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| JexError::invalid_object(object_type.as_str(), format!("missing string field '{}'", field)))
}

fn visit_field(object_type: ObjectType, object: &Value) -> Result<u64> {
    object
        .get("visit")
        .and_then(Value::as_u64)
        .ok_or_else(|| JexError::invalid_object(object_type.as_str(), "missing integer field 'visit'"))
}

fn origin_hex(object_type: ObjectType, object: &Value) -> Result<String> {
    Ok(sha256(str_field(object_type, object, "origin")?).to_hex())
}

fn origin_identity(object_type: ObjectType, object: &Value) -> Result<Option<NodeId>> {
    Ok(Some(sha256(str_field(object_type, object, "url")?)))
}

fn origin_visit_identity(object_type: ObjectType, object: &Value) -> Result<Option<NodeId>> {
    let origin = origin_hex(object_type, object)?;
    let visit = visit_field(object_type, object)?;
    Ok(Some(sha256(format!("{}:{}", origin, visit))))
}

fn origin_visit_status_identity(object_type: ObjectType, object: &Value) -> Result<Option<NodeId>> {
    // Ongoing visits are superseded by a final status
    if !matches!(str_field(object_type, object, "status")?, "partial" | "full") {
        return Ok(None);
    }
    let origin = origin_hex(object_type, object)?;
    let visit = visit_field(object_type, object)?;
    let date = str_field(object_type, object, "date")?;
    let date = DateTime::parse_from_rfc3339(date)
        .map_err(|e| JexError::invalid_object(object_type.as_str(), format!("bad date '{}': {}", date, e)))?;
    Ok(Some(sha256(format!("{}:{}:{}", origin, visit, date.timestamp_micros()))))
}

fn content_identity(object_type: ObjectType, object: &Value) -> Result<Option<NodeId>> {
    match object.get("sha1_git") {
        Some(Value::String(hash)) => NodeId::from_hex(object_type.as_str(), hash).map(Some),
        // Skipped contents may lack a git hash; fall back on the canonical
        // record, cut to the git hash width so a set keeps one key length
        Some(Value::Null) | None if object_type == ObjectType::SkippedContent => {
            let digest = sha256(serde_json::to_vec(object)?);
            Ok(Some(NodeId::from_bytes(&digest.as_bytes()[..GIT_HASH_LEN])))
        },
        _ => Err(JexError::invalid_object(object_type.as_str(), "missing field 'sha1_git'")),
    }
}

fn intrinsic_identity(object_type: ObjectType, object: &Value) -> Result<Option<NodeId>> {
    NodeId::from_hex(object_type.as_str(), str_field(object_type, object, "id")?).map(Some)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_type_names_round_trip() {
        for object_type in ObjectType::ALL {
            assert_eq!(object_type.as_str().parse::<ObjectType>().unwrap(), object_type);
        }
        assert!("tarball".parse::<ObjectType>().is_err());
    }

    #[test]
    fn test_origin_identity_is_url_digest() {
        let id = ObjectType::Origin
            .identity(&json!({"url": "https://example.org/repo"}))
            .unwrap()
            .unwrap();
        assert_eq!(id, sha256("https://example.org/repo"));
    }

    #[test]
    fn test_origin_visit_identity_depends_on_visit() {
        let first = json!({"origin": "https://example.org/repo", "visit": 1});
        let second = json!({"origin": "https://example.org/repo", "visit": 2});
        let a = ObjectType::OriginVisit.identity(&first).unwrap().unwrap();
        let b = ObjectType::OriginVisit.identity(&second).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, ObjectType::OriginVisit.identity(&first).unwrap().unwrap());
    }

    #[test]
    fn test_non_final_visit_status_is_skipped() {
        let ongoing = json!({
            "origin": "https://example.org/repo",
            "visit": 3,
            "status": "ongoing",
            "date": "2021-01-01T00:00:00+00:00"
        });
        assert_eq!(ObjectType::OriginVisitStatus.identity(&ongoing).unwrap(), None);

        let full = json!({
            "origin": "https://example.org/repo",
            "visit": 3,
            "status": "full",
            "date": "2021-01-01T00:00:00+00:00"
        });
        assert!(ObjectType::OriginVisitStatus.identity(&full).unwrap().is_some());
    }

    #[test]
    fn test_visit_status_identity_ignores_timezone_notation() {
        let utc = json!({"origin": "o", "visit": 1, "status": "partial", "date": "2021-01-01T12:00:00+00:00"});
        let cet = json!({"origin": "o", "visit": 1, "status": "partial", "date": "2021-01-01T13:00:00+01:00"});
        assert_eq!(
            ObjectType::OriginVisitStatus.identity(&utc).unwrap(),
            ObjectType::OriginVisitStatus.identity(&cet).unwrap()
        );
    }

    #[test]
    fn test_derived_identities_hash_sha256_and_micros() {
        let origin_hex = sha256("https://example.org/repo").to_hex();
        let visit = json!({"origin": "https://example.org/repo", "visit": 4});
        assert_eq!(
            ObjectType::OriginVisit.identity(&visit).unwrap().unwrap(),
            sha256(format!("{}:4", origin_hex))
        );

        let status = json!({
            "origin": "https://example.org/repo",
            "visit": 4,
            "status": "full",
            "date": "2021-01-01T00:00:00.5+00:00"
        });
        let id = ObjectType::OriginVisitStatus.identity(&status).unwrap().unwrap();
        assert_eq!(id, sha256(format!("{}:4:1609459200500000", origin_hex)));
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn test_intrinsic_identities() {
        let hash = "94a9ed024d3859793618152ea559a168bbcbb5e2";
        let content = ObjectType::Content
            .identity(&json!({"sha1_git": hash, "length": 3}))
            .unwrap()
            .unwrap();
        assert_eq!(content.len(), 20);
        assert_eq!(content.to_hex(), hash);

        let revision = ObjectType::Revision.identity(&json!({"id": hash})).unwrap().unwrap();
        assert_eq!(revision, content);
    }

    #[test]
    fn test_skipped_content_without_git_hash() {
        let skipped = json!({"sha1_git": null, "reason": "too big", "length": 1 << 30});
        let fallback = ObjectType::SkippedContent.identity(&skipped).unwrap().unwrap();
        assert_eq!(fallback.len(), GIT_HASH_LEN);
        assert!(ObjectType::Content.identity(&skipped).is_err());

        let hashed = json!({"sha1_git": "94a9ed024d3859793618152ea559a168bbcbb5e2", "reason": "too big"});
        let hashed = ObjectType::SkippedContent.identity(&hashed).unwrap().unwrap();
        assert_eq!(hashed.len(), fallback.len());
        assert_ne!(hashed, fallback);
    }

    #[test]
    fn test_missing_identity_field_is_an_error() {
        let err = ObjectType::Snapshot.identity(&json!({"branches": {}})).unwrap_err();
        assert!(err.to_string().contains("snapshot"));
    }

    #[test]
    fn test_normalize_flattens_origin_and_dates() {
        let raw = br#"{"origin": {"url": "https://example.org/repo"}, "visit": 1, "date": 1600000000}"#;
        let object = ObjectType::OriginVisit.decode(raw).unwrap();
        assert_eq!(object["origin"], "https://example.org/repo");
        assert_eq!(object["date"], "2020-09-13T12:26:40+00:00");
    }

    #[test]
    fn test_normalize_rejects_non_objects() {
        assert!(ObjectType::Origin.decode(b"[1, 2]").is_err());
        assert!(ObjectType::Origin.decode(b"not json").is_err());
    }
}
