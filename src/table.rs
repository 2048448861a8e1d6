//! Plain-text table rendering for CLI output.

use std::{borrow::Cow, fmt::Write as _};

use crate::{dataset::Dataset, schema::ColumnType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Right,
}

impl Alignment {
    pub fn for_type(datatype: ColumnType) -> Self {
        if datatype.is_numeric() {
            Alignment::Right
        } else {
            Alignment::Left
        }
    }
}

pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    render_aligned(headers, rows, &[])
}

/// Renders with per-column alignment; columns beyond `alignments` align left.
pub fn render_aligned(headers: &[String], rows: &[Vec<String>], alignments: &[Alignment]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| display_width(h).max(1)).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(display_width(&sanitize_cell(cell)));
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(headers, &widths, &[]));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat((*w).max(3))).collect();
    let rule_widths: Vec<usize> = widths.iter().map(|w| (*w).max(3)).collect();
    let _ = writeln!(output, "{}", format_row(&rule, &rule_widths, &[]));
    for row in rows {
        let _ = writeln!(output, "{}", format_row(row, &widths, alignments));
    }
    output
}

/// Renders a dataset's columns and up to `limit` records, numbers right-aligned.
pub fn render_dataset(dataset: &Dataset, limit: Option<usize>) -> String {
    let headers = dataset.column_names();
    let alignments: Vec<Alignment> = dataset
        .columns
        .iter()
        .map(|c| Alignment::for_type(c.datatype))
        .collect();
    render_aligned(&headers, &dataset.display_rows(limit), &alignments)
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn format_row(values: &[String], widths: &[usize], alignments: &[Alignment]) -> String {
    let cells: Vec<String> = values
        .iter()
        .zip(widths.iter())
        .enumerate()
        .map(|(idx, (value, width))| {
            let cell = sanitize_cell(value);
            let padding = " ".repeat(width.saturating_sub(display_width(&cell)));
            match alignments.get(idx).copied().unwrap_or(Alignment::Left) {
                Alignment::Left => format!("{cell}{padding}"),
                Alignment::Right => format!("{padding}{cell}"),
            }
        })
        .collect();
    cells.join("  ").trim_end().to_string()
}

fn display_width(value: &str) -> usize {
    let mut width = 0usize;
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            // ANSI colour sequence, e.g. \x1b[31m
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
        } else {
            width += 1;
        }
    }
    width
}

fn sanitize_cell(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::Value, schema::ColumnMeta};

    #[test]
    fn numeric_columns_align_right() {
        let dataset = Dataset::from_rows(
            "kpi",
            vec![
                ColumnMeta::new("state", ColumnType::String),
                ColumnMeta::new("orders", ColumnType::Integer),
            ],
            vec![
                vec![Some(Value::String("SP".into())), Some(Value::Integer(1200))],
                vec![Some(Value::String("RJ".into())), Some(Value::Integer(7))],
            ],
        );
        let rendered = render_dataset(&dataset, None);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "state  orders");
        assert_eq!(lines[1], "-----  ------");
        assert_eq!(lines[2], "SP       1200");
        assert_eq!(lines[3], "RJ          7");
    }

    #[test]
    fn embedded_newlines_are_flattened() {
        let rendered = render_table(&["note".to_string()], &[vec!["a\nb".to_string()]]);
        assert!(rendered.lines().any(|line| line == "a b"));
    }
}
