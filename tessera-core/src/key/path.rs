//! Mapping between row keys and `/`-delimited paths
//!
//! Components are rendered per dimension: integers in decimal, datetimes in
//! RFC 3339, strings with `%` and `/` percent-escaped. The empty string is
//! `%e` so it stays distinct from nil, which is the empty component.
//! Partial keys end with `/`, so a full key whose last dimension is nil
//! reads back as a partial key.

use chrono::{DateTime, SecondsFormat, Utc};

use super::RowKey;
use crate::schema::{Dimensions, KeyType};
use crate::{Datum, Result, TesseraError};

const EMPTY_STRING: &str = "%e";

pub(super) fn key_to_path(key: &RowKey, dims: &Dimensions) -> Result<String> {
    let values = key.decode(dims)?;
    let mut components = Vec::with_capacity(values.len());
    for value in &values {
        components.push(match value {
            Datum::Nil => String::new(),
            Datum::String(s) if s.is_empty() => EMPTY_STRING.to_string(),
            Datum::String(s) => escape(s),
            Datum::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            other => other.to_string(),
        });
    }
    let mut path = components.join("/");
    if key.dimension_count() < dims.len() {
        path.push('/');
    }
    Ok(path)
}

pub(super) fn path_to_key(dims: &Dimensions, path: &str) -> Result<RowKey> {
    let body = path.strip_suffix('/').unwrap_or(path);
    let partial = body.len() != path.len();
    if partial && body.is_empty() {
        return Ok(RowKey::empty());
    }

    let components: Vec<&str> = body.split('/').collect();
    if components.len() > dims.len() {
        return Err(TesseraError::InvalidKey(format!(
            "path {:?} has more components than the {} dimensions",
            path,
            dims.len()
        )));
    }

    let mut values = Vec::with_capacity(components.len());
    for (component, desc) in components.iter().zip(dims.iter()) {
        values.push(parse_component(component, desc.key_type)?);
    }
    RowKey::encode(dims, &values)
}

fn parse_component(component: &str, key_type: KeyType) -> Result<Datum> {
    if component.is_empty() {
        return Ok(Datum::Nil);
    }
    let bad = || TesseraError::InvalidKey(format!("invalid {} path component {:?}", key_type, component));
    match key_type {
        KeyType::Int32 => component.parse::<i32>().map(Datum::Int32).map_err(|_| bad()),
        KeyType::Int64 => component.parse::<i64>().map(Datum::Int64).map_err(|_| bad()),
        KeyType::DateTime => DateTime::parse_from_rfc3339(component)
            .map(|dt| Datum::DateTime(dt.with_timezone(&Utc)))
            .map_err(|_| bad()),
        KeyType::Utf8 | KeyType::ListUtf8 => {
            if component == EMPTY_STRING {
                Ok(Datum::String(String::new()))
            } else {
                unescape(component).map(Datum::String).ok_or_else(bad)
            }
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(i) = rest.find('%') {
        out.push_str(&rest[..i]);
        let code = rest.get(i + 1..i + 3)?;
        match code.to_ascii_uppercase().as_str() {
            "25" => out.push('%'),
            "2F" => out.push('/'),
            _ => return None,
        }
        rest = &rest[i + 3..];
    }
    out.push_str(rest);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DimensionDesc;

    fn dims() -> Dimensions {
        Dimensions::new(vec![
            DimensionDesc::new(KeyType::Utf8),
            DimensionDesc::new(KeyType::Int32),
        ])
        .unwrap()
    }

    #[test]
    fn test_path_round_trip() {
        let dims = dims();
        let key = RowKey::encode(&dims, &[Datum::from("a/100%"), Datum::Int32(-4)]).unwrap();
        let path = key.to_path(&dims).unwrap();
        assert_eq!(path, "a%2F100%25/-4");
        assert_eq!(RowKey::from_path(&dims, &path).unwrap(), key);
    }

    #[test]
    fn test_empty_string_and_nil() {
        let dims = Dimensions::new(vec![
            DimensionDesc::new(KeyType::Int32),
            DimensionDesc::new(KeyType::Utf8),
        ])
        .unwrap();
        let empty = RowKey::encode(&dims, &[Datum::Nil, Datum::from("")]).unwrap();
        assert_eq!(empty.to_path(&dims).unwrap(), "/%e");
        assert_eq!(RowKey::from_path(&dims, "/%e").unwrap(), empty);

        // a trailing slash always means a partial key
        let partial = RowKey::from_path(&dims, "7/").unwrap();
        assert_eq!(partial.dimension_count(), 1);
    }

    #[test]
    fn test_partial_paths() {
        let dims = dims();
        let partial = RowKey::from_path(&dims, "docs/").unwrap();
        assert_eq!(partial.dimension_count(), 1);
        assert_eq!(partial.to_path(&dims).unwrap(), "docs/");
        assert!(RowKey::from_path(&dims, "/").unwrap().is_empty());
        assert!(RowKey::from_path(&dims, "a/1/2").is_err());
        assert!(RowKey::from_path(&dims, "a/x").is_err());
    }
}
