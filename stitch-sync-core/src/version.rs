use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Wire field every synchronized remote document carries its version under.
/// Absence of this field is itself meaningful: a document legitimately
/// written by a non-sync client.
pub const VERSION_FIELD: &str = "__stitch_sync_version";

/// `{syncProtocolVersion, instanceId, versionCounter}`, embedded in remote
/// documents at [`VERSION_FIELD`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    #[serde(rename = "spv")]
    pub sync_protocol_version: i32,
    #[serde(rename = "id")]
    pub instance_id: String,
    #[serde(rename = "v")]
    pub version_counter: u64,
}

/// The only protocol version this implementation emits or accepts.
pub const SYNC_PROTOCOL_VERSION: i32 = 1;

impl DocumentVersion {
    /// Mints a version with a fresh, randomly chosen instance id and counter
    /// zero. Used on first remote insert of a document.
    pub fn fresh() -> Self {
        DocumentVersion {
            sync_protocol_version: SYNC_PROTOCOL_VERSION,
            instance_id: Uuid::new_v4().to_string(),
            version_counter: 0,
        }
    }

    /// `{protoVer=1, instanceId=self.instanceId, counter=self.counter+1}`.
    pub fn next(&self) -> Self {
        DocumentVersion {
            sync_protocol_version: SYNC_PROTOCOL_VERSION,
            instance_id: self.instance_id.clone(),
            version_counter: self.version_counter + 1,
        }
    }
}

/// `nextVersion(local)`: bumps `local` if present, else mints a fresh version.
pub fn next_version(local: Option<&DocumentVersion>) -> DocumentVersion {
    match local {
        Some(v) => v.next(),
        None => DocumentVersion::fresh(),
    }
}

/// Extracts the embedded version from a remote document.
///
/// A malformed version subdocument (wrong type, missing field) is a
/// [`SyncError::VersionParseError`]; the caller's policy is to desync the
/// affected document, not to abort the whole pass.
pub fn get_remote_version_info(doc: &Value) -> SyncResult<Option<DocumentVersion>> {
    match doc.get(VERSION_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| SyncError::VersionParseError(e.to_string())),
    }
}

/// `hasCommittedVersion(local, incoming)`: true iff both are present, share
/// `instanceId`, and `incoming.counter <= local.counter` — the incoming event
/// cannot carry information we have not already applied or authored.
pub fn has_committed_version(
    local: Option<&DocumentVersion>,
    incoming: Option<&DocumentVersion>,
) -> bool {
    match (local, incoming) {
        (Some(local), Some(incoming)) => {
            local.instance_id == incoming.instance_id
                && incoming.version_counter <= local.version_counter
        }
        _ => false,
    }
}

/// Embeds `version` into `doc` at [`VERSION_FIELD`], replacing any existing
/// value.
pub fn embed_version(doc: &mut Value, version: &DocumentVersion) {
    if let Value::Object(map) = doc {
        map.insert(
            VERSION_FIELD.to_string(),
            serde_json::to_value(version).expect("DocumentVersion always serializes"),
        );
    }
}

/// Strips [`VERSION_FIELD`] before storing a document to the local side or
/// passing it to the user's conflict resolver. Idempotent: sanitizing an
/// already-sanitized document is a no-op.
pub fn sanitize(doc: &mut Value) {
    if let Value::Object(map) = doc {
        map.remove(VERSION_FIELD);
    }
}

/// Non-mutating counterpart of [`sanitize`].
pub fn sanitized(doc: &Value) -> Value {
    let mut out = doc.clone();
    sanitize(&mut out);
    out
}

/// `{updatedFields: map<path,value>, removedFields: set<path>}`, computed by
/// structural diff of a before/after document pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub updated_fields: HashMap<String, Value>,
    pub removed_fields: HashSet<String>,
}

impl UpdateDescription {
    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.removed_fields.is_empty()
    }
}

/// Produces the minimal `{updatedFields, removedFields}` such that applying
/// it to `before` yields `after`. An empty diff means no-op and must not be
/// emitted as an UPDATE. Dotted paths descend into nested objects; arrays and
/// scalars are compared and replaced wholesale when they differ.
pub fn update_description_diff(before: &Value, after: &Value) -> UpdateDescription {
    let mut desc = UpdateDescription::default();
    diff_into(before, after, "", &mut desc);
    desc
}

fn diff_into(before: &Value, after: &Value, prefix: &str, desc: &mut UpdateDescription) {
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            for (key, before_val) in before_map {
                let path = join_path(prefix, key);
                match after_map.get(key) {
                    Some(after_val) => diff_into(before_val, after_val, &path, desc),
                    None => {
                        desc.removed_fields.insert(path);
                    }
                }
            }
            for (key, after_val) in after_map {
                if !before_map.contains_key(key) {
                    let path = join_path(prefix, key);
                    desc.updated_fields.insert(path, after_val.clone());
                }
            }
        }
        _ => {
            if before != after {
                desc.updated_fields.insert(prefix.to_string(), after.clone());
            }
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Applies an [`UpdateDescription`] to `doc` in place, translating dotted
/// paths into nested object mutations. Used both by the local-apply path and
/// by the remote `$set`/`$unset` translation in the L2R pass.
pub fn apply_update_description(doc: &mut Value, desc: &UpdateDescription) {
    for (path, value) in &desc.updated_fields {
        set_path(doc, path, value.clone());
    }
    for path in &desc.removed_fields {
        remove_path(doc, path);
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_path_segments(doc, &segments, value);
}

fn set_path_segments(doc: &mut Value, segments: &[&str], value: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let map = doc.as_object_mut().expect("just coerced to object");
    match segments {
        [last] => {
            map.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = map.entry((*head).to_string()).or_insert_with(|| Value::Object(Map::new()));
            set_path_segments(child, rest, value);
        }
        [] => {}
    }
}

fn remove_path(doc: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    remove_path_segments(doc, &segments);
}

fn remove_path_segments(doc: &mut Value, segments: &[&str]) {
    let Some(map) = doc.as_object_mut() else { return };
    match segments {
        [last] => {
            map.remove(*last);
        }
        [head, rest @ ..] => {
            if let Some(child) = map.get_mut(*head) {
                remove_path_segments(child, rest);
            }
        }
        [] => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_version_increments_counter_and_preserves_instance() {
        let v = DocumentVersion {
            sync_protocol_version: 1,
            instance_id: "abc".into(),
            version_counter: 4,
        };
        let next = next_version(Some(&v));
        assert_eq!(next.version_counter, 5);
        assert_eq!(next.instance_id, "abc");
    }

    #[test]
    fn next_version_mints_fresh_when_absent() {
        let v = next_version(None);
        assert_eq!(v.version_counter, 0);
        assert!(!v.instance_id.is_empty());
    }

    #[test]
    fn malformed_version_is_parse_error() {
        let doc = json!({"_id": 1, VERSION_FIELD: "not-an-object"});
        let err = get_remote_version_info(&doc).unwrap_err();
        assert!(matches!(err, SyncError::VersionParseError(_)));
    }

    #[test]
    fn absence_of_version_is_distinct_from_any_present_version() {
        let doc = json!({"_id": 1});
        assert_eq!(get_remote_version_info(&doc).unwrap(), None);
    }

    #[test]
    fn has_committed_version_requires_same_instance_and_not_newer() {
        let local = DocumentVersion {
            sync_protocol_version: 1,
            instance_id: "g".into(),
            version_counter: 3,
        };
        let same_older = DocumentVersion {
            version_counter: 2,
            ..local.clone()
        };
        let same_newer = DocumentVersion {
            version_counter: 4,
            ..local.clone()
        };
        let other_instance = DocumentVersion {
            instance_id: "h".into(),
            ..local.clone()
        };

        assert!(has_committed_version(Some(&local), Some(&same_older)));
        assert!(has_committed_version(Some(&local), Some(&local.clone())));
        assert!(!has_committed_version(Some(&local), Some(&same_newer)));
        assert!(!has_committed_version(Some(&local), Some(&other_instance)));
        assert!(!has_committed_version(None, Some(&local)));
        assert!(!has_committed_version(Some(&local), None));
    }

    #[test]
    fn sanitize_is_idempotent_and_strips_version() {
        let mut doc = json!({"_id": 1, "x": "a", VERSION_FIELD: {"spv":1,"id":"g","v":0}});
        sanitize(&mut doc);
        assert!(!doc.as_object().unwrap().contains_key(VERSION_FIELD));
        sanitize(&mut doc);
        assert!(!doc.as_object().unwrap().contains_key(VERSION_FIELD));
    }

    #[test]
    fn diff_of_identical_documents_is_empty() {
        let a = json!({"_id": 1, "x": "a"});
        assert!(update_description_diff(&a, &a).is_empty());
    }

    #[test]
    fn diff_roundtrips_through_apply() {
        let before = json!({"_id": 1, "x": "a", "nested": {"y": 1, "z": 2}});
        let after = json!({"_id": 1, "x": "b", "nested": {"y": 1}, "w": true});
        let diff = update_description_diff(&before, &after);
        assert!(!diff.is_empty());

        let mut doc = before.clone();
        apply_update_description(&mut doc, &diff);
        assert_eq!(doc, after);
    }
}
