use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::backend::ResultSet;
use crate::error::{internal_error, LiveQueryResult};

use super::options::CollectionOptions;
use super::state::{ChangeType, DocumentChange, DocumentRecord};

#[derive(Debug)]
pub(crate) struct ProcessedSnapshot<T> {
    pub records: Vec<DocumentRecord<T>>,
    pub changes: Vec<DocumentChange<T>>,
}

/// Turns a raw backend result into the next committed record array.
///
/// The steps run in fixed order: id merge, decode, transform, filter, stable
/// sort, then an id-keyed diff against the previous commit. Any error aborts
/// the whole update; the caller keeps its previous records.
pub(crate) fn process_snapshot<T>(
    raw: ResultSet,
    previous: &[DocumentRecord<T>],
    options: &CollectionOptions<T>,
    path: &str,
) -> LiveQueryResult<ProcessedSnapshot<T>>
where
    T: DeserializeOwned + Serialize + Clone,
{
    let mut records = Vec::with_capacity(raw.len());
    for document in raw {
        let id = document.id;
        let mut fields = document.fields;
        // The backend-assigned id always wins over a stored `id` field.
        fields.insert("id".to_string(), Value::String(id.clone()));
        let data: T = serde_json::from_value(Value::Object(fields)).map_err(|err| {
            internal_error(format!("failed to decode document '{id}': {err}")).with_path(path)
        })?;
        records.push(DocumentRecord { id, data });
    }

    if let Some(transform) = options.transform() {
        for record in &mut records {
            record.data = transform(record.data.clone())
                .map_err(|err| err.with_path(path))?;
        }
    }

    if let Some(filter) = options.filter() {
        records.retain(|record| filter(&record.data));
    }

    if let Some(sort) = options.sort() {
        records.sort_by(|left, right| sort(&left.data, &right.data));
    }

    let changes = diff_records(previous, &records);
    Ok(ProcessedSnapshot { records, changes })
}

/// Classifies each record as added, modified, or removed by identity key.
///
/// Modification is structural JSON inequality of the serialized records.
/// Serialization failure counts as a modification.
fn diff_records<T>(
    previous: &[DocumentRecord<T>],
    next: &[DocumentRecord<T>],
) -> Vec<DocumentChange<T>>
where
    T: Serialize + Clone,
{
    let previous_by_id: HashMap<&str, &DocumentRecord<T>> = previous
        .iter()
        .map(|record| (record.id.as_str(), record))
        .collect();
    let next_ids: HashSet<&str> = next.iter().map(|record| record.id.as_str()).collect();

    let mut changes = Vec::new();
    for record in next {
        match previous_by_id.get(record.id.as_str()) {
            None => changes.push(DocumentChange {
                change_type: ChangeType::Added,
                id: record.id.clone(),
                record: record.data.clone(),
            }),
            Some(old) => {
                if !json_equal(&old.data, &record.data) {
                    changes.push(DocumentChange {
                        change_type: ChangeType::Modified,
                        id: record.id.clone(),
                        record: record.data.clone(),
                    });
                }
            }
        }
    }
    for record in previous {
        if !next_ids.contains(record.id.as_str()) {
            changes.push(DocumentChange {
                change_type: ChangeType::Removed,
                id: record.id.clone(),
                record: record.data.clone(),
            });
        }
    }
    changes
}

fn json_equal<T: Serialize>(left: &T, right: &T) -> bool {
    match (serde_json::to_value(left), serde_json::to_value(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}
