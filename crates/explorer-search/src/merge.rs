//! Version-gated document merge.
//!
//! Tantivy has no server-side scripting, so the merge rules run here and the
//! engine applies the result as a read-modify-write under its writer lock.
//! Applying the same operation twice yields the same document, and two
//! upserts for one document commute.

use serde_json::{Map, Value};

use crate::document::StoredDocument;

/// Array of `{id, version, deleted?, ...}` entries merged per entry.
pub const SUB_RESOURCES_FIELD: &str = "subResources";
/// Sub-document replaced by audience updates.
pub const AUDIENCE_FIELD: &str = "audience";

/// Overrides derived from the resource row at a given version. The rest
/// (folder links, hierarchy) reflect current relational state.
const VERSIONED_OVERRIDES: &[&str] = &["creatorId", "rights", "visibleBy"];

fn sub_id(entry: &Value) -> Option<String> {
    match entry.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn sub_version(entry: &Value) -> i64 {
    entry.get("version").and_then(Value::as_i64).unwrap_or_default()
}

pub(crate) fn sub_deleted(entry: &Value) -> bool {
    entry.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

/// Splice `incoming` sub-resources into `base`.
///
/// An entry replaces the stored entry with the same id only when its version
/// is strictly greater. A deleted entry with a greater version removes the
/// stored one, unless `keep_deleted` is set, in which case the tombstone is
/// kept so a later stage can still apply it. Entries without an id are
/// ignored.
pub fn merge_sub_resources(base: &mut Vec<Value>, incoming: &[Value], keep_deleted: bool) {
    for entry in incoming {
        let Some(id) = sub_id(entry) else {
            continue;
        };
        let position = base.iter().position(|e| sub_id(e).as_deref() == Some(id.as_str()));
        match position {
            Some(i) => {
                if sub_version(entry) > sub_version(&base[i]) {
                    if sub_deleted(entry) && !keep_deleted {
                        base.remove(i);
                    } else {
                        base[i] = entry.clone();
                    }
                }
            }
            None => {
                if keep_deleted || !sub_deleted(entry) {
                    base.push(entry.clone());
                }
            }
        }
    }
}

fn merge_sub_field(source: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    let Some(Value::Array(entries)) = incoming.get(SUB_RESOURCES_FIELD) else {
        return;
    };
    let mut base = match source.remove(SUB_RESOURCES_FIELD) {
        Some(Value::Array(existing)) => existing,
        _ => Vec::new(),
    };
    // Tombstones keep their version so an older replay cannot re-add the entry
    merge_sub_resources(&mut base, entries, true);
    source.insert(SUB_RESOURCES_FIELD.to_string(), Value::Array(base));
}

fn apply_overrides(source: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        source.insert(key.clone(), value.clone());
    }
}

fn apply_structural_overrides(source: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        if !VERSIONED_OVERRIDES.contains(&key.as_str()) {
            source.insert(key.clone(), value.clone());
        }
    }
}

/// Upsert `fields` at `version` onto the stored document, if any.
///
/// Overrides tied to the resource version are only taken when `version` is
/// not older than the stored one. Returns the new document and whether it
/// was created.
pub fn apply_upsert(
    stored: Option<StoredDocument>,
    index: &str,
    id: &str,
    version: i64,
    fields: &Map<String, Value>,
    overrides: &Map<String, Value>,
) -> (StoredDocument, bool) {
    match stored {
        None => {
            let mut document = StoredDocument::new(index, id, version);
            for (key, value) in fields {
                if key != SUB_RESOURCES_FIELD {
                    document.source.insert(key.clone(), value.clone());
                }
            }
            merge_sub_field(&mut document.source, fields);
            apply_overrides(&mut document.source, overrides);
            (document, true)
        }
        Some(mut document) => {
            let stale = version < document.version;
            if version > document.version {
                for (key, value) in fields {
                    if key != SUB_RESOURCES_FIELD {
                        document.source.insert(key.clone(), value.clone());
                    }
                }
                document.version = version;
            }
            merge_sub_field(&mut document.source, fields);
            if stale {
                apply_structural_overrides(&mut document.source, overrides);
            } else {
                apply_overrides(&mut document.source, overrides);
            }
            (document, false)
        }
    }
}

/// Replace the audience sub-document.
///
/// Uses `fields.audience` when present, otherwise the whole field map.
pub fn apply_audience(mut document: StoredDocument, fields: &Map<String, Value>) -> StoredDocument {
    let audience = fields
        .get(AUDIENCE_FIELD)
        .cloned()
        .unwrap_or_else(|| Value::Object(fields.clone()));
    document.source.insert(AUDIENCE_FIELD.to_string(), audience);
    document
}

/// Overwrite individual fields without touching the version.
pub fn apply_patch(mut document: StoredDocument, fields: &Map<String, Value>) -> StoredDocument {
    apply_overrides(&mut document.source, fields);
    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_keeps_tombstones_out_of_live_entries() {
        let (doc, created) = apply_upsert(
            None,
            "drive",
            "1",
            1,
            &fields(json!({"name": "a", "subResources": [
                {"id": "s1", "version": 1},
                {"id": "s2", "version": 1, "deleted": true}
            ]})),
            &Map::new(),
        );
        assert!(created);
        assert_eq!(doc.live_sub_resources(), vec![json!({"id": "s1", "version": 1})]);
        assert_eq!(doc.source["subResources"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_deleted_sub_resource_stays_deleted_after_older_replay() {
        let upsert = |doc: Option<StoredDocument>, sub: Value| {
            apply_upsert(doc, "drive", "1", 1, &fields(json!({"subResources": [sub]})), &Map::new()).0
        };
        let doc = upsert(None, json!({"id": "s", "version": 5, "body": "v5"}));
        let doc = upsert(Some(doc), json!({"id": "s", "version": 6, "deleted": true}));
        assert!(doc.live_sub_resources().is_empty());

        let doc = upsert(Some(doc), json!({"id": "s", "version": 5, "body": "v5"}));
        assert!(doc.live_sub_resources().is_empty());
        assert_eq!(doc.source["subResources"], json!([{"id": "s", "version": 6, "deleted": true}]));

        let doc = upsert(Some(doc), json!({"id": "s", "version": 7, "body": "v7"}));
        assert_eq!(doc.live_sub_resources(), vec![json!({"id": "s", "version": 7, "body": "v7"})]);
    }

    #[test]
    fn test_version_gate_is_strict() {
        let (v3, _) = apply_upsert(None, "drive", "1", 3, &fields(json!({"name": "three"})), &Map::new());
        let (after_v1, _) = apply_upsert(
            Some(v3.clone()),
            "drive",
            "1",
            1,
            &fields(json!({"name": "one"})),
            &Map::new(),
        );
        assert_eq!(after_v1.version, 3);
        assert_eq!(after_v1.source["name"], json!("three"));

        let (same, _) = apply_upsert(Some(v3), "drive", "1", 3, &fields(json!({"name": "again"})), &Map::new());
        assert_eq!(same.source["name"], json!("three"));
    }

    #[test]
    fn test_versions_commute() {
        let upsert = |doc: Option<StoredDocument>, v: i64| {
            apply_upsert(doc, "drive", "1", v, &fields(json!({"name": format!("v{}", v)})), &Map::new()).0
        };
        let forward = upsert(Some(upsert(Some(upsert(None, 3)), 1)), 2);
        let backward = upsert(Some(upsert(Some(upsert(None, 1)), 2)), 3);
        assert_eq!(forward, backward);
        assert_eq!(forward.source["name"], json!("v3"));
    }

    #[test]
    fn test_sub_resources_merge_per_entry() {
        let mut base = vec![
            json!({"id": "a", "version": 2, "text": "old"}),
            json!({"id": "b", "version": 5}),
        ];
        merge_sub_resources(
            &mut base,
            &[
                json!({"id": "a", "version": 3, "text": "new"}),
                json!({"id": "b", "version": 4, "deleted": true}),
                json!({"id": "c", "version": 1}),
                json!({"version": 9}),
            ],
            false,
        );
        assert_eq!(
            base,
            vec![
                json!({"id": "a", "version": 3, "text": "new"}),
                json!({"id": "b", "version": 5}),
                json!({"id": "c", "version": 1}),
            ]
        );

        merge_sub_resources(&mut base, &[json!({"id": "b", "version": 6, "deleted": true})], false);
        assert_eq!(base.len(), 2);
    }

    #[test]
    fn test_sub_resources_merge_even_when_document_is_stale() {
        let (stored, _) = apply_upsert(
            None,
            "drive",
            "1",
            5,
            &fields(json!({"subResources": [{"id": 1, "version": 1}]})),
            &Map::new(),
        );
        let (merged, _) = apply_upsert(
            Some(stored),
            "drive",
            "1",
            2,
            &fields(json!({"subResources": [{"id": 1, "version": 2, "body": "x"}]})),
            &Map::new(),
        );
        assert_eq!(merged.version, 5);
        assert_eq!(merged.source["subResources"], json!([{"id": 1, "version": 2, "body": "x"}]));
    }

    #[test]
    fn test_overrides_always_apply() {
        let (stored, _) = apply_upsert(None, "folder", "9", 5, &Map::new(), &Map::new());
        let (merged, _) = apply_upsert(
            Some(stored),
            "folder",
            "9",
            1,
            &Map::new(),
            &fields(json!({"childrenIds": [3]})),
        );
        assert_eq!(merged.source["childrenIds"], json!([3]));
    }

    #[test]
    fn test_stale_upsert_keeps_versioned_overrides() {
        let (stored, _) = apply_upsert(
            None,
            "drive",
            "r",
            3,
            &Map::new(),
            &fields(json!({"rights": ["user:new:read"], "visibleBy": ["user:new"], "folderIds": [1]})),
        );
        let (merged, _) = apply_upsert(
            Some(stored.clone()),
            "drive",
            "r",
            1,
            &Map::new(),
            &fields(json!({"rights": ["user:revoked:read"], "visibleBy": ["user:revoked"], "folderIds": [2]})),
        );
        assert_eq!(merged.version, 3);
        assert_eq!(merged.visible_by(), vec!["user:new".to_string()]);
        assert_eq!(merged.source["rights"], json!(["user:new:read"]));
        assert_eq!(merged.source["folderIds"], json!([2]));

        let (redelivered, _) = apply_upsert(
            Some(stored),
            "drive",
            "r",
            3,
            &Map::new(),
            &fields(json!({"visibleBy": ["user:new", "user:late"]})),
        );
        assert_eq!(redelivered.visible_by().len(), 2);
    }

    #[test]
    fn test_audience_and_patch() {
        let doc = StoredDocument::new("drive", "1", 1);
        let doc = apply_audience(doc, &fields(json!({"audience": {"views": 4}})));
        assert_eq!(doc.source["audience"], json!({"views": 4}));

        let doc = apply_patch(doc, &fields(json!({"childrenIds": [1, 2]})));
        assert_eq!(doc.source["childrenIds"], json!([1, 2]));
        assert_eq!(doc.version, 1);
    }
}
