use crate::core::{FetchFlags, Result, Value};
use crate::result::ResultSet;
use serde_json::{Map, Value as JsonValue};

/// Fully fetched rows, for display
///
/// BLOB columns are fetched inline, so the rows hold their contents rather
/// than open handles.
#[derive(Debug)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Drain `rs` into memory
    pub fn collect(rs: &mut ResultSet) -> Result<Self> {
        let columns = rs.fields().iter().map(|f| f.alias.clone()).collect();
        let mut rows = Vec::new();
        while let Some(cells) = rs.fetch_row(FetchFlags::TEXT_BLOBS)? {
            rows.push(cells.into_iter().filter_map(|c| c.into_value()).collect());
        }
        Ok(Self { columns, rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as JSON objects keyed by column
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(
            self.rows
                .iter()
                .map(|row| {
                    let object: Map<String, JsonValue> = self
                        .columns
                        .iter()
                        .cloned()
                        .zip(row.iter().map(value_to_json))
                        .collect();
                    JsonValue::Object(object)
                })
                .collect(),
        )
    }

    /// Render as an aligned text table
    pub fn render(&self) -> String {
        if self.columns.is_empty() {
            return "Empty result set\n".to_string();
        }

        let rendered: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(display_value).collect())
            .collect();

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();
        for row in &rendered {
            for (i, cell) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell.chars().count());
                }
            }
        }

        let mut out = String::new();
        let header: Vec<String> = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(col, w)| format!("{:width$}", col, width = w))
            .collect();
        out.push_str(&header.join(" | "));
        out.push('\n');

        let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&separator.join("-+-"));
        out.push('\n');

        for row in &rendered {
            let line: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(cell, w)| format!("{:width$}", cell, width = w))
                .collect();
            out.push_str(&line.join(" | "));
            out.push('\n');
        }

        out.push_str(&format!("\n{} row(s)\n", self.rows.len()));
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => value.to_string(),
        },
        other => other.to_string(),
    }
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Integer(i) => JsonValue::from(*i),
        Value::Float(f) => JsonValue::from(*f),
        Value::Text(s) => JsonValue::from(s.as_str()),
        Value::Boolean(b) => JsonValue::from(*b),
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => JsonValue::from(text),
            Err(_) => JsonValue::from(bytes.clone()),
        },
        Value::Blob(id) => JsonValue::from(id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueryResult {
        QueryResult {
            columns: vec!["ID".into(), "NAME".into()],
            rows: vec![
                vec![Value::Integer(1), Value::Text("Alice".into())],
                vec![Value::Integer(22), Value::Bytes(b"bob".to_vec())],
            ],
        }
    }

    #[test]
    fn test_render_aligns_columns() {
        let text = sample().render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID | NAME ");
        assert_eq!(lines[1], "---+------");
        assert_eq!(lines[2], "1  | Alice");
        assert_eq!(lines[3], "22 | bob  ");
        assert!(text.ends_with("2 row(s)\n"));
    }

    #[test]
    fn test_empty_result() {
        let result = QueryResult::empty();
        assert!(result.is_empty());
        assert_eq!(result.render(), "Empty result set\n");
    }

    #[test]
    fn test_to_json() {
        let json = sample().to_json();
        assert_eq!(json[0]["NAME"], "Alice");
        assert_eq!(json[1]["ID"], 22);
        assert_eq!(json[1]["NAME"], "bob");
    }
}
