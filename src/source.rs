//! Record sources feeding the replayer.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use crate::config::ColumnMapping;
use crate::error::SourceError;
use crate::frame::Sample;

pub type Records<'a> = Box<dyn Iterator<Item = Result<Sample, SourceError>> + Send + 'a>;

/// Ordered supplier of samples. Each call to `records` starts a new pass
/// from the first record.
pub trait RecordSource {
    fn describe(&self) -> String;
    fn records(&self) -> Result<Records<'_>, SourceError>;
}

impl RecordSource for Vec<Sample> {
    fn describe(&self) -> String {
        format!("{} in-memory samples", self.len())
    }

    fn records(&self) -> Result<Records<'_>, SourceError> {
        Ok(Box::new(self.iter().copied().map(Ok)))
    }
}

/// CSV log with a header row. Columns are located by their raw names and
/// everything else in the row is ignored.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    /// Field index of each canonical column, in canonical order.
    indices: [usize; 9],
}

impl CsvSource {
    pub fn open(path: impl Into<PathBuf>, columns: &ColumnMapping) -> Result<Self, SourceError> {
        let path = path.into();
        let file = File::open(&path).map_err(|source| SourceError::Unavailable {
            path: path.clone(),
            source,
        })?;

        let mut header = String::new();
        BufReader::new(file)
            .read_line(&mut header)
            .map_err(|source| SourceError::Unavailable {
                path: path.clone(),
                source,
            })?;
        let header = header.strip_prefix('\u{feff}').unwrap_or(&header);
        let names = split_fields(header);

        let mut indices = [0usize; 9];
        for (slot, wanted) in indices.iter_mut().zip(columns.raw_names()) {
            *slot = names
                .iter()
                .position(|n| n == wanted)
                .ok_or_else(|| SourceError::MissingColumn {
                    path: path.clone(),
                    column: wanted.to_string(),
                })?;
        }

        tracing::debug!("opened {} with column indices {:?}", path.display(), indices);
        Ok(CsvSource { path, indices })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSource for CsvSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn records(&self) -> Result<Records<'_>, SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Unavailable {
            path: self.path.clone(),
            source,
        })?;
        let mut lines = BufReader::new(file).lines();
        // header
        lines.next().transpose()?;
        Ok(Box::new(CsvRows {
            lines,
            line: 1,
            indices: self.indices,
        }))
    }
}

struct CsvRows {
    lines: Lines<BufReader<File>>,
    line: usize,
    indices: [usize; 9],
}

impl Iterator for CsvRows {
    type Item = Result<Sample, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(t) => t,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            return Some(parse_row(&text, &self.indices).map_err(|detail| SourceError::Record {
                line: self.line,
                detail,
            }));
        }
    }
}

/// Split one CSV line. Quoted fields may contain commas and `""` escapes;
/// unquoted fields are trimmed.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = line.trim_end_matches(['\r', '\n']).chars().peekable();

    loop {
        while chars.next_if(|c| *c == ' ' || *c == '\t').is_some() {}
        let mut field = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '"' if chars.next_if_eq(&'"').is_some() => field.push('"'),
                    '"' => break,
                    c => field.push(c),
                }
            }
            // anything between the closing quote and the delimiter is dropped
            while chars.next_if(|c| *c != ',').is_some() {}
            fields.push(field);
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                field.push(c);
            }
            fields.push(field.trim_end().to_string());
        }

        if chars.next().is_none() {
            return fields;
        }
    }
}

fn parse_row(line: &str, indices: &[usize; 9]) -> Result<Sample, String> {
    let owned = split_fields(line);
    let fields: Vec<&str> = owned.iter().map(String::as_str).collect();
    let field = |i: usize| column(&fields, indices[i]);

    let sensor_id = parse_integer(field(0)?, "sensor_id")?;
    let timestamp = parse_integer(field(1)?, "time")?;

    let mut floats = [0f32; 7];
    for (k, slot) in floats.iter_mut().enumerate() {
        let raw = field(k + 2)?;
        *slot = raw
            .parse::<f64>()
            .map_err(|e| format!("field {} '{raw}': {e}", k + 3))? as f32;
    }

    Ok(Sample {
        sensor_id,
        timestamp,
        position: [floats[0], floats[1], floats[2]],
        orientation: [floats[3], floats[4], floats[5], floats[6]],
    })
}

fn column<'a>(fields: &[&'a str], index: usize) -> Result<&'a str, String> {
    fields
        .get(index)
        .copied()
        .ok_or_else(|| format!("expected column {}, row has {} fields", index + 1, fields.len()))
}

/// Integer columns are often written as floats (`1.0`); those are truncated
/// toward zero.
fn parse_integer(raw: &str, name: &str) -> Result<i64, String> {
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(v);
    }
    let v = raw
        .parse::<f64>()
        .map_err(|e| format!("{name} '{raw}': {e}"))?;
    if !v.is_finite() || v.trunc() < i64::MIN as f64 || v.trunc() >= i64::MAX as f64 {
        return Err(format!("{name} '{raw}' is not a representable integer"));
    }
    Ok(v.trunc() as i64)
}
