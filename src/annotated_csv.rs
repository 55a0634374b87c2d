//! Incremental decoder for Flux annotated CSV query responses.
//!
//! The query endpoint streams its result as annotated CSV: each table starts
//! with `#datatype`, `#group` and `#default` annotation rows and a header row,
//! followed by data rows, and tables are separated by a blank line. Bytes are
//! pushed in whatever chunks the network delivers and complete rows come out
//! as [`QueryRow`]s.

use serde_json::{Number, Value};

use crate::store::{QueryRow, StoreError};

#[derive(Debug, Clone)]
struct Column {
    name: String,
    datatype: String,
    default: String,
}

#[derive(Debug)]
enum Table {
    Data(Vec<Column>),
    /// In-band error table (`error,reference` header)
    Error,
}

/// Push-based annotated CSV decoder.
///
/// After the first error the decoder stops producing output.
#[derive(Debug, Default)]
pub struct AnnotatedCsvDecoder {
    pending: Vec<u8>,
    scan_pos: usize,
    in_quotes: bool,
    datatypes: Vec<String>,
    defaults: Vec<String>,
    table: Option<Table>,
    failed: bool,
}

impl AnnotatedCsvDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body and collect the rows it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<QueryRow, StoreError>> {
        let mut out = Vec::new();
        if self.failed {
            return out;
        }
        self.pending.extend_from_slice(chunk);

        // start of the first record not yet decoded
        let mut start = 0;
        while let Some(end) = self.next_record_end() {
            let record = self.pending[start..end].to_vec();
            start = end + 1;
            self.scan_pos = start;
            self.process_record(&record, &mut out);
            if self.failed {
                self.pending.clear();
                self.scan_pos = 0;
                return out;
            }
        }

        self.pending.drain(..start);
        self.scan_pos -= start;
        out
    }

    /// Flush a trailing record that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<Result<QueryRow, StoreError>> {
        let mut out = Vec::new();
        if self.failed || self.pending.is_empty() {
            return out;
        }
        if self.in_quotes {
            self.failed = true;
            out.push(Err(StoreError::Parse(
                "unterminated quoted field at end of response".to_string(),
            )));
            return out;
        }
        let record = std::mem::take(&mut self.pending);
        self.process_record(&record, &mut out);
        out
    }

    /// Index of the newline ending the next complete record, honouring quotes.
    fn next_record_end(&mut self) -> Option<usize> {
        while self.scan_pos < self.pending.len() {
            let b = self.pending[self.scan_pos];
            if b == b'"' {
                self.in_quotes = !self.in_quotes;
            } else if b == b'\n' && !self.in_quotes {
                return Some(self.scan_pos);
            }
            self.scan_pos += 1;
        }
        None
    }

    fn process_record(&mut self, raw: &[u8], out: &mut Vec<Result<QueryRow, StoreError>>) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.strip_suffix('\r').unwrap_or(line),
            Err(e) => {
                self.fail(out, StoreError::Parse(format!("invalid UTF-8 in response: {}", e)));
                return;
            }
        };

        if line.is_empty() {
            self.table = None;
            self.datatypes.clear();
            self.defaults.clear();
            return;
        }

        let mut cells = parse_record(line);

        if line.starts_with('#') {
            // an annotation always opens a new table
            self.table = None;
            let kind = cells.remove(0);
            match kind.as_str() {
                "#datatype" => self.datatypes = cells,
                "#default" => self.defaults = cells,
                _ => {}
            }
            return;
        }

        // the first column is the annotation column and carries no data
        if !cells.is_empty() {
            cells.remove(0);
        }

        match self.table.take() {
            None => self.table = Some(self.header(cells)),
            Some(Table::Error) => {
                let message = cells.first().cloned().unwrap_or_default();
                let message = match cells.get(1).filter(|r| !r.is_empty()) {
                    Some(reference) => format!("{} (reference {})", message, reference),
                    None => message,
                };
                self.table = Some(Table::Error);
                self.fail(out, StoreError::Query(message));
            }
            Some(Table::Data(columns)) => {
                out.push(Ok(to_row(&columns, cells)));
                self.table = Some(Table::Data(columns));
            }
        }
    }

    fn header(&self, names: Vec<String>) -> Table {
        if names.len() >= 2 && names[0] == "error" && names[1] == "reference" {
            return Table::Error;
        }

        let columns = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| Column {
                name,
                datatype: self
                    .datatypes
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| "string".to_string()),
                default: self.defaults.get(i).cloned().unwrap_or_default(),
            })
            .collect();
        Table::Data(columns)
    }

    fn fail(&mut self, out: &mut Vec<Result<QueryRow, StoreError>>, err: StoreError) {
        self.failed = true;
        out.push(Err(err));
    }
}

fn to_row(columns: &[Column], cells: Vec<String>) -> QueryRow {
    let mut row = QueryRow::new();
    let mut cells = cells.into_iter();
    for column in columns {
        let cell = cells.next().unwrap_or_default();
        row.insert(column.name.clone(), typed_value(column, cell));
    }
    row
}

fn typed_value(column: &Column, cell: String) -> Value {
    let raw = if cell.is_empty() {
        column.default.clone()
    } else {
        cell
    };

    match column.datatype.as_str() {
        "string" => Value::String(raw),
        _ if raw.is_empty() => Value::Null,
        "long" => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        "unsignedLong" => raw
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        "double" => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(raw)),
        "boolean" => match raw.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw),
        },
        _ => Value::String(raw),
    }
}

/// Split one CSV record into cells, unquoting `"..."` and `""`.
fn parse_record(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    cell.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(c),
        }
    }
    cells.push(cell);
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RESPONSE: &str = "#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,double,string,string,string,string\r\n\
#group,false,false,true,true,false,false,true,true,true,true\r\n\
#default,_result,,,,,,,,,\r\n\
,result,table,_start,_stop,_time,_value,_field,_measurement,location,unit\r\n\
,,0,1970-01-01T00:00:00Z,2020-01-02T00:00:00Z,2020-01-01T00:00:00Z,1.5,height,tide,Hanalei,feet\r\n\
,,0,1970-01-01T00:00:00Z,2020-01-02T00:00:00Z,2020-01-01T00:06:00Z,-0.25,height,tide,Hanalei,feet\r\n\
\r\n";

    fn decode_all(chunks: &[&[u8]]) -> Vec<Result<QueryRow, StoreError>> {
        let mut decoder = AnnotatedCsvDecoder::new();
        let mut rows = Vec::new();
        for chunk in chunks {
            rows.extend(decoder.push(chunk));
        }
        rows.extend(decoder.finish());
        rows
    }

    #[test]
    fn test_decode_rows_with_types_and_defaults() {
        let rows = decode_all(&[RESPONSE.as_bytes()]);
        assert_eq!(rows.len(), 2);

        let first = rows[0].as_ref().unwrap();
        assert_eq!(
            serde_json::Value::Object(first.clone()),
            json!({
                "result": "_result",
                "table": 0,
                "_start": "1970-01-01T00:00:00Z",
                "_stop": "2020-01-02T00:00:00Z",
                "_time": "2020-01-01T00:00:00Z",
                "_value": 1.5,
                "_field": "height",
                "_measurement": "tide",
                "location": "Hanalei",
                "unit": "feet"
            })
        );
        assert_eq!(rows[1].as_ref().unwrap()["_value"], json!(-0.25));
    }

    #[test]
    fn test_decode_across_arbitrary_chunks() {
        let bytes = RESPONSE.as_bytes();
        for split in [1, 7, 64, 200, bytes.len() - 1] {
            let rows = decode_all(&[&bytes[..split], &bytes[split..]]);
            assert_eq!(rows.len(), 2, "split at {}", split);
            assert!(rows.iter().all(|r| r.is_ok()));
        }
    }

    #[test]
    fn test_many_rows_in_one_chunk() {
        let header = "#datatype,string,long,double,string\n,result,table,_value,location\n";
        let mut body = header.to_string();
        for i in 0..2000 {
            body.push_str(&format!(",_result,0,{},Hilo\n", i));
        }
        body.push_str(",_result,0,20");

        let mut decoder = AnnotatedCsvDecoder::new();
        let rows = decoder.push(body.as_bytes());

        assert_eq!(rows.len(), 2000);
        assert_eq!(rows[1999].as_ref().unwrap()["_value"], json!(1999.0));
        // only the unterminated record is kept
        assert_eq!(decoder.pending, b",_result,0,20".to_vec());

        let rows = decoder.push(b"01.5,Hilo\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_ref().unwrap()["_value"], json!(2001.5));
        assert!(decoder.pending.is_empty());
        assert_eq!(decoder.scan_pos, 0);
    }

    #[test]
    fn test_multiple_tables_in_order() {
        let body = "#datatype,string,long,string\n\
#group,false,false,true\n\
#default,_result,,\n\
,result,table,location\n\
,,0,Hanalei\n\
\n\
#datatype,string,long,string\n\
#group,false,false,true\n\
#default,_result,,\n\
,result,table,location\n\
,,1,Hilo\n";
        let rows = decode_all(&[body.as_bytes()]);
        let locations: Vec<_> = rows
            .iter()
            .map(|r| r.as_ref().unwrap()["location"].clone())
            .collect();
        assert_eq!(locations, vec![json!("Hanalei"), json!("Hilo")]);
        assert_eq!(rows[1].as_ref().unwrap()["table"], json!(1));
    }

    #[test]
    fn test_quoted_cells() {
        let body = "#datatype,string,string\n,result,location\n,,\"Kahului, \"\"Maui\"\"\nline\"\n";
        let rows = decode_all(&[body.as_bytes()]);
        assert_eq!(
            rows[0].as_ref().unwrap()["location"],
            json!("Kahului, \"Maui\"\nline")
        );
    }

    #[test]
    fn test_empty_result() {
        assert!(decode_all(&[b""]).is_empty());
        assert!(decode_all(&[b"\r\n"]).is_empty());
    }

    #[test]
    fn test_error_table() {
        let body = "#datatype,string,string\n#group,true,true\n#default,,\n,error,reference\n,\"failed to parse regex\",897\n";
        let rows = decode_all(&[body.as_bytes()]);
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            Err(StoreError::Query(message)) => {
                assert!(message.contains("failed to parse regex"));
                assert!(message.contains("897"));
            }
            other => panic!("expected query error, got {:?}", other),
        }
    }

    #[test]
    fn test_rows_after_error_are_dropped() {
        let mut decoder = AnnotatedCsvDecoder::new();
        let rows = decoder.push(b",error,reference\n,boom,\n");
        assert_eq!(rows.len(), 1);
        assert!(decoder.push(b",,more\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_missing_trailing_newline() {
        let body = "#datatype,string,double\n,result,_value\n,,2.5";
        let rows = decode_all(&[body.as_bytes()]);
        assert_eq!(rows[0].as_ref().unwrap()["_value"], json!(2.5));
    }

    #[test]
    fn test_non_string_empty_cell_is_null() {
        let body = "#datatype,string,double,string\n,result,_value,note\n,,,\n";
        let rows = decode_all(&[body.as_bytes()]);
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row["_value"], Value::Null);
        assert_eq!(row["note"], json!(""));
    }

    #[test]
    fn test_parse_record() {
        assert_eq!(parse_record(",a,\"b,c\","), vec!["", "a", "b,c", ""]);
    }
}
