//! Result Tables and Text Reports
//!
//! Two outputs come out of a run:
//!
//! - a per-essay text report, one block per prompt, easy to read side by side
//! - a CSV table with one row per (prompt, temperature), which the perplexity
//!   run reads back, scores and writes out again with an extra column
//!
//! ## CSV dialect
//!
//! Comma separated, `\n` line endings, header row first. Fields containing a
//! comma, quote, CR or LF are quoted and embedded quotes doubled. A missing
//! value is an empty unquoted field; an empty string is written as `""` so
//! the two survive a round trip.

use crate::error::{Result, TouchstoneError};
use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Separator line of the text reports
pub const LINEBREAK: &str = "--------------------------------------------------------------------------------";

const COLUMNS: [&str; 6] = [
    "essay",
    "full_prompt",
    "short_prompt",
    "act_output",
    "temp",
    "pred_output",
];
const PERPLEXITY_COLUMN: &str = "perplexity";

/// One line of a result table
///
/// Rows for the actual continuation carry no temperature and no prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultRow {
    pub essay: usize,
    pub full_prompt: String,
    pub short_prompt: String,
    pub act_output: String,
    pub temp: Option<f32>,
    pub pred_output: Option<String>,
    pub perplexity: Option<f64>,
}

/// An in-memory result table
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultTable {
    pub rows: Vec<ResultRow>,
    /// Whether the `perplexity` column is written
    pub with_perplexity: bool,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sort by essay, then temperature, rows without one last
    ///
    /// The sort is stable: rows that tie keep their insertion order.
    pub fn sort_by_essay_and_temp(&mut self) {
        self.rows
            .sort_by(|a, b| a.essay.cmp(&b.essay).then_with(|| cmp_temp(a.temp, b.temp)));
    }

    /// Essay ids in order of first appearance
    pub fn essays(&self) -> Vec<usize> {
        let mut seen = Vec::new();
        for row in &self.rows {
            if !seen.contains(&row.essay) {
                seen.push(row.essay);
            }
        }
        seen
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let mut header: Vec<&str> = COLUMNS.to_vec();
        if self.with_perplexity {
            header.push(PERPLEXITY_COLUMN);
        }
        out.push_str(&header.join(","));
        out.push('\n');

        for row in &self.rows {
            let mut fields = vec![
                row.essay.to_string(),
                quote(&row.full_prompt),
                quote(&row.short_prompt),
                quote(&row.act_output),
                row.temp.map(|t| format!("{:?}", t)).unwrap_or_default(),
                row.pred_output.as_deref().map(quote).unwrap_or_default(),
            ];
            if self.with_perplexity {
                fields.push(row.perplexity.map(|p| p.to_string()).unwrap_or_default());
            }
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_csv())?;
        Ok(())
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::parse_csv(&fs::read_to_string(path)?)
    }

    /// Parse a table written by [`ResultTable::to_csv`]
    ///
    /// The header must name the six base columns in order, optionally
    /// followed by `perplexity`.
    pub fn parse_csv(text: &str) -> Result<Self> {
        let records = parse_records(text)?;
        let mut records = records.into_iter();

        let header = records.next().ok_or_else(|| TouchstoneError::InvalidTable {
            line: 1,
            reason: "missing header".to_string(),
        })?;
        let names: Vec<&str> = header.fields.iter().map(|f| f.text.as_str()).collect();
        let with_perplexity = if names == COLUMNS {
            false
        } else if names.len() == 7 && names[..6] == COLUMNS && names[6] == PERPLEXITY_COLUMN {
            true
        } else {
            return Err(TouchstoneError::InvalidTable {
                line: 1,
                reason: format!("unexpected header {:?}", names),
            });
        };

        let mut table = ResultTable {
            rows: Vec::new(),
            with_perplexity,
        };
        for record in records {
            table.push(record.into_row(names.len())?);
        }
        Ok(table)
    }
}

fn cmp_temp(a: Option<f32>, b: Option<f32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Quote a field when it needs it; empty strings are always quoted
fn quote(field: &str) -> String {
    if field.is_empty() || field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

struct Field {
    text: String,
    quoted: bool,
}

struct Record {
    /// Line the record starts on, 1-based
    line: usize,
    fields: Vec<Field>,
}

impl Record {
    fn into_row(self, width: usize) -> Result<ResultRow> {
        let line = self.line;
        if self.fields.len() != width {
            return Err(TouchstoneError::InvalidTable {
                line,
                reason: format!("expected {} fields, found {}", width, self.fields.len()),
            });
        }
        let bad = |column: &str, value: &str| TouchstoneError::InvalidTable {
            line,
            reason: format!("invalid {} {:?}", column, value),
        };

        let mut fields = self.fields.into_iter();
        let mut next = || fields.next().unwrap_or(Field {
            text: String::new(),
            quoted: false,
        });

        let essay = next();
        let essay = essay
            .text
            .parse::<usize>()
            .map_err(|_| bad("essay", &essay.text))?;
        let full_prompt = next().text;
        let short_prompt = next().text;
        let act_output = next().text;
        let temp = optional(next(), |s| s.parse::<f32>().ok()).map_err(|v| bad("temp", &v))?;
        let pred_output = optional(next(), |s| Some(s.to_string())).map_err(|v| bad("pred_output", &v))?;
        let perplexity = if width == 7 {
            optional(next(), |s| s.parse::<f64>().ok()).map_err(|v| bad("perplexity", &v))?
        } else {
            None
        };

        Ok(ResultRow {
            essay,
            full_prompt,
            short_prompt,
            act_output,
            temp,
            pred_output,
            perplexity,
        })
    }
}

/// Empty unquoted → `None`; otherwise parsed, returning the raw text on failure
fn optional<T>(field: Field, parse: impl Fn(&str) -> Option<T>) -> std::result::Result<Option<T>, String> {
    if field.text.is_empty() && !field.quoted {
        return Ok(None);
    }
    parse(&field.text).map(Some).ok_or(field.text)
}

/// Split CSV text into records, honouring quoted fields that span lines
fn parse_records(text: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut at_record_start = true;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => {
                    if c == '\n' {
                        line += 1;
                    }
                    field.push(c);
                }
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
                at_record_start = false;
            }
            ',' => {
                fields.push(Field {
                    text: std::mem::take(&mut field),
                    quoted,
                });
                quoted = false;
                at_record_start = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                if !at_record_start {
                    fields.push(Field {
                        text: std::mem::take(&mut field),
                        quoted,
                    });
                    records.push(Record {
                        line: record_line,
                        fields: std::mem::take(&mut fields),
                    });
                }
                quoted = false;
                at_record_start = true;
                line += 1;
                record_line = line;
            }
            _ => {
                if quoted {
                    return Err(TouchstoneError::InvalidTable {
                        line,
                        reason: "text after closing quote".to_string(),
                    });
                }
                field.push(c);
                at_record_start = false;
            }
        }
    }

    if in_quotes {
        return Err(TouchstoneError::InvalidTable {
            line: record_line,
            reason: "unterminated quoted field".to_string(),
        });
    }
    if !at_record_start {
        fields.push(Field { text: field, quoted });
        records.push(Record {
            line: record_line,
            fields,
        });
    }
    Ok(records)
}

/// Write one prompt's block of a text report
///
/// ```text
/// ----------…
/// ----------…
/// Prompt: <short prompt>
/// ----------…
/// Actual Output: <actual>
/// ----------…
/// Predicted Output (w/temp 0.5): <prediction>
/// ----------…
/// ...
/// ----------…
/// (two blank lines)
/// ```
pub fn write_prompt_block<W: Write>(
    writer: &mut W,
    prompt_short: &str,
    actual_output: &str,
    temperatures: &[f32],
    pred_outputs: &[String],
) -> Result<()> {
    writeln!(writer, "{}", LINEBREAK)?;
    writeln!(writer, "{}", LINEBREAK)?;
    writeln!(writer, "Prompt: {}", prompt_short)?;
    writeln!(writer, "{}", LINEBREAK)?;
    writeln!(writer, "Actual Output: {}", actual_output)?;
    writeln!(writer, "{}", LINEBREAK)?;
    for (temp, pred_output) in temperatures.iter().zip(pred_outputs) {
        writeln!(writer, "Predicted Output (w/temp {:?}): {}", temp, pred_output)?;
        writeln!(writer, "{}", LINEBREAK)?;
    }
    write!(writer, "{}\n\n\n", LINEBREAK)?;
    Ok(())
}
