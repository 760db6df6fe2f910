//! Word count, the canonical workload.

use std::path::Path;

use crate::KeyValue;

pub fn map(_input: &Path, contents: &str) -> Vec<KeyValue> {
    contents
        .split_whitespace()
        .map(|word| KeyValue {
            key: word.to_owned(),
            value: "1".to_owned(),
        })
        .collect()
}

pub fn reduce(_key: &str, values: &[String]) -> String {
    values.len().to_string()
}
