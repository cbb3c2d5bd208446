// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Flattening snapshot annotations into upload form fields, and reading the upload knobs
//! the embedder configures through its own annotations.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crash_handler_common::{ProcessSnapshot, SimpleStringDictionary};
use tracing::warn;

/// Form field holding all modules' list annotations, newline-separated.
pub const LIST_ANNOTATIONS_KEY: &str = "list_annotations";
/// Form field holding the client identifier.
pub const GUID_KEY: &str = "guid";

pub const ATTACHMENT_KILOBYTE_LIMIT_KEY: &str = "UploadAttachmentKiloByteLimit";
pub const UPLOAD_PERCENTAGE_KEY: &str = "UploadPercentage";
pub const FORMAT_KEY: &str = "Format";
/// The [`FORMAT_KEY`] value selecting minidump uploads.
pub const MINIDUMP_FORMAT: &str = "minidump";

/// A value that lost a key collision while building form parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscardedValue {
    pub key: String,
    pub value: String,
}

/// Form parameters along with every value dropped while building them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormParameters {
    pub parameters: BTreeMap<String, String>,
    pub discarded: Vec<DiscardedValue>,
}

impl FormParameters {
    /// Insert unless `key` is already present, in which case `value` is discarded.
    fn insert_if_absent(&mut self, key: &str, value: String) {
        match self.parameters.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(_) => {
                warn!("duplicate key {}, discarding value {}", key, value);
                self.discarded.push(DiscardedValue {
                    key: key.to_owned(),
                    value,
                });
            }
        }
    }

    /// Insert, discarding any previous value of `key`.
    fn insert_or_replace(&mut self, key: &str, value: String) {
        if let Some(old_value) = self.parameters.insert(key.to_owned(), value) {
            warn!("duplicate key {}, discarding value {}", key, old_value);
            self.discarded.push(DiscardedValue {
                key: key.to_owned(),
                value: old_value,
            });
        }
    }
}

/// Build HTTP form parameters from the annotations of `snapshot`.
///
/// The process-level simple annotations seed the result. Then, module by module in snapshot
/// order, simple annotations and string-typed annotation objects are added; on a key
/// collision the value inserted first is kept. List annotations from all modules are joined
/// with `'\n'` into [`LIST_ANNOTATIONS_KEY`], and [`GUID_KEY`] is always set to the snapshot's
/// client identifier. Both reserved keys replace whatever annotation had the same name.
pub fn form_parameters_from_snapshot(snapshot: &dyn ProcessSnapshot) -> FormParameters {
    let mut form = FormParameters {
        parameters: snapshot.annotations_simple_map().clone(),
        discarded: Vec::new(),
    };

    let mut list_annotations = Vec::new();
    for module in snapshot.modules() {
        for (key, value) in module.annotations_simple_map() {
            form.insert_if_absent(key, value.clone());
        }

        list_annotations.extend(module.annotations_vector().iter().map(String::as_str));

        for annotation in module.annotation_objects() {
            if let Some(value) = annotation.string_value() {
                form.insert_if_absent(&annotation.name, value.into_owned());
            }
        }
    }

    if !list_annotations.is_empty() {
        form.insert_or_replace(LIST_ANNOTATIONS_KEY, list_annotations.join("\n"));
    }

    form.insert_or_replace(GUID_KEY, snapshot.client_id().hyphenated().to_string());

    form
}

/// Build HTTP form parameters from the annotations of `snapshot`.
///
/// See [`form_parameters_from_snapshot`] for the merge rules.
pub fn http_form_parameters_from_snapshot(snapshot: &dyn ProcessSnapshot) -> BTreeMap<String, String> {
    form_parameters_from_snapshot(snapshot).parameters
}

fn annotation_i64(annotations: &SimpleStringDictionary, name: &str, default: i64) -> i64 {
    annotations
        .get_value_for_key(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// The per-attachment byte ceiling, configured in kilobytes through
/// [`ATTACHMENT_KILOBYTE_LIMIT_KEY`].
pub fn upload_attachment_file_size_limit(
    annotations: &SimpleStringDictionary,
    default_kilobytes: i64,
) -> i64 {
    annotation_i64(annotations, ATTACHMENT_KILOBYTE_LIMIT_KEY, default_kilobytes).saturating_mul(1000)
}

/// The percentage of reports to upload, configured through [`UPLOAD_PERCENTAGE_KEY`].
pub fn upload_percentage(annotations: &SimpleStringDictionary, default_percentage: i32) -> i32 {
    let percentage = annotation_i64(annotations, UPLOAD_PERCENTAGE_KEY, default_percentage.into());
    i32::try_from(percentage).unwrap_or(default_percentage)
}

/// Whether reports go out as minidumps.
pub fn upload_minidump(annotations: &SimpleStringDictionary) -> bool {
    annotations.get_value_for_key(FORMAT_KEY) == Some(MINIDUMP_FORMAT)
}
