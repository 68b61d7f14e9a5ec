//! Word count: how many times each word appears across all input files.
//! Words are runs of alphanumeric characters, compared case-insensitively.

use anyhow::Result;
use bytes::Bytes;

use crate::{string_from_bytes, KeyValue, MapOutput};

pub fn map(kv: KeyValue) -> MapOutput {
    let contents = string_from_bytes(kv.value)?;
    let words = contents
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| Ok(KeyValue::new(word.to_lowercase(), "1")))
        .collect::<Vec<_>>();
    Ok(Box::new(words.into_iter()))
}

pub fn reduce(key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>) -> Result<Bytes> {
    let mut count = 0u64;
    for value in values {
        count += string_from_bytes(value)?.parse::<u64>()?;
    }
    let word = string_from_bytes(key)?;
    Ok(Bytes::from(format!("{} {}\n", word, count)))
}
