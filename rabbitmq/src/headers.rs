use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;
use traces::Headers;
use tracing::debug;

pub fn to_field_table(headers: &Headers) -> FieldTable {
    let table = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            )
        })
        .collect::<BTreeMap<_, _>>();

    FieldTable::from(table)
}

/// Keeps the string valued entries; anything else has no meaning to the relay.
pub fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let Some(table) = table else {
        return Headers::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(value) => {
                    String::from_utf8(value.as_bytes().to_vec()).ok()
                }
                AMQPValue::ShortString(value) => Some(value.as_str().to_owned()),
                _ => None,
            };

            if value.is_none() {
                debug!(header = key.as_str(), "skipping non string header");
            }

            value.map(|value| (key.as_str().to_owned(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongInt;

    #[test]
    fn should_convert_headers_both_ways() {
        let headers: Headers = [
            ("trace_id".to_owned(), "4bf92f3577b34da6a3ce929d0e0e4736".to_owned()),
            ("span_id".to_owned(), "00f067aa0ba902b7".to_owned()),
        ]
        .into_iter()
        .collect();

        let table = to_field_table(&headers);

        assert_eq!(from_field_table(Some(&table)), headers);
    }

    #[test]
    fn should_keep_only_string_values() {
        let mut table = BTreeMap::new();
        table.insert(
            ShortString::from("short"),
            AMQPValue::ShortString(ShortString::from("a")),
        );
        table.insert(ShortString::from("count"), AMQPValue::LongInt(LongInt::from(3)));
        table.insert(
            ShortString::from("long"),
            AMQPValue::LongString(LongString::from("b")),
        );
        table.insert(
            ShortString::from("trace_id"),
            AMQPValue::LongString(LongString::from(vec![0xff_u8, 0xfe, 0x41])),
        );

        let headers = from_field_table(Some(&FieldTable::from(table)));

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("short").unwrap(), "a");
        assert_eq!(headers.get("long").unwrap(), "b");
        assert!(!headers.contains_key("trace_id"));
    }

    #[test]
    fn should_return_empty_headers_without_table() {
        assert!(from_field_table(None).is_empty());
    }
}
