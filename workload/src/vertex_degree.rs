//! A MapReduce-compatible application that computes the
//! degree of each vertex in a graph, given a list of edges.
//!

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{string_from_bytes, KeyValue, MapOutput};

fn parse_line(line: &str) -> Result<(u64, u64)> {
    let mut iter = line.split_whitespace().take(2);
    let a = iter
        .next()
        .ok_or_else(|| anyhow!("edge line `{line}` has no source vertex"))?
        .parse()?;
    let b = iter
        .next()
        .ok_or_else(|| anyhow!("edge line `{line}` has no target vertex"))?
        .parse()?;
    Ok((a, b))
}

pub fn map(kv: KeyValue) -> MapOutput {
    let s = string_from_bytes(kv.value)?;
    let edges = s
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect::<Result<Vec<_>>>()?;

    let iter = edges.into_iter().flat_map(|(a, b)| {
        [
            Ok(KeyValue::new(a.to_string(), "1")),
            Ok(KeyValue::new(b.to_string(), "1")),
        ]
    });
    Ok(Box::new(iter))
}

pub fn reduce(key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>) -> Result<Bytes> {
    let mut count = 0u64;

    for value in values {
        count += string_from_bytes(value)?.parse::<u64>()?;
    }

    let mut value = BytesMut::with_capacity(24);
    let vertex_no = string_from_bytes(key)?;
    value.put(format!("{} deg={}\n", &vertex_no, count).as_bytes());
    Ok(value.freeze())
}
