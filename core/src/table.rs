use std::ops::Index;
use std::sync::LazyLock;

use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// One parsed table row: column header -> raw cell text, in header order.
/// Serializes as a JSON object whose keys follow the table's columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row(Vec<(String, String)>);

impl Row {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut cells: Vec<(String, String)> = Vec::new();
        for (name, value) in iter {
            // a repeated header keeps its first position, last value wins
            match cells.iter_mut().find(|(existing, _)| *existing == name) {
                Some(cell) => cell.1 = value,
                None => cells.push((name, value)),
            }
        }
        Self(cells)
    }
}

impl Index<&str> for Row {
    type Output = String;

    fn index(&self, column: &str) -> &String {
        match self.0.iter().find(|(name, _)| name == column) {
            Some((_, value)) => value,
            None => panic!("no column named {column:?} in row"),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Substrings that mark a line as tool chatter rather than table content.
///
/// This is a compatibility shim for the query tool's human-oriented output,
/// which has no versioned format. It is brittle by nature: a new banner or
/// spinner frame in a future release shows up as a bogus header or a dropped
/// row until the marker is added here (or passed via `--noise-marker`).
pub const DEFAULT_NOISE_MARKERS: &[&str] = &[
    "✔",
    "✖",
    "Success",
    "Initiating query",
    "Initiated query",
    "Query returned",
    "query completed",
    "Running query",
    "⠋",
    "⠙",
    "⠹",
    "⠸",
    "⠼",
    "⠴",
    "⠦",
    "⠧",
    "⠇",
    "⠏",
];

static COLUMN_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("column gap pattern is valid"));

/// Parses space-aligned text tables into rows.
#[derive(Debug, Clone)]
pub struct TableParser {
    noise_markers: Vec<String>,
}

impl Default for TableParser {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl TableParser {
    /// Builds a parser using the default markers plus `extra_markers`.
    pub fn new<I, S>(extra_markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut noise_markers: Vec<String> = DEFAULT_NOISE_MARKERS
            .iter()
            .map(|marker| (*marker).to_string())
            .collect();
        for marker in extra_markers {
            let marker = marker.into();
            if !marker.is_empty() && !noise_markers.contains(&marker) {
                noise_markers.push(marker);
            }
        }
        Self { noise_markers }
    }

    pub fn noise_markers(&self) -> &[String] {
        &self.noise_markers
    }

    fn is_noise(&self, line: &str) -> bool {
        self.noise_markers
            .iter()
            .any(|marker| line.contains(marker.as_str()))
    }

    /// Lazily yields the rows of `text`. Malformed or empty input yields nothing.
    pub fn parse<'a>(&self, text: &'a str) -> TableRows<'a> {
        let lines: Vec<&'a str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !self.is_noise(line))
            .collect();

        let Some((header_line, rest)) = lines.split_first() else {
            return TableRows::empty();
        };
        let header = split_columns(header_line);

        let data = match rest.split_first() {
            Some((first, tail)) if is_separator(first) => tail,
            _ => rest,
        };

        TableRows {
            header,
            lines: data.to_vec().into_iter(),
        }
    }
}

/// Iterator over parsed rows. Dash-only rules and lines whose column count
/// differs from the header are skipped.
#[derive(Debug)]
pub struct TableRows<'a> {
    header: Vec<String>,
    lines: std::vec::IntoIter<&'a str>,
}

impl TableRows<'_> {
    fn empty() -> Self {
        Self {
            header: Vec::new(),
            lines: Vec::new().into_iter(),
        }
    }
}

impl Iterator for TableRows<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        for line in self.lines.by_ref() {
            if is_separator(line) {
                continue;
            }
            let cells = split_columns(line);
            if cells.len() != self.header.len() {
                continue;
            }
            return Some(self.header.iter().cloned().zip(cells).collect());
        }
        None
    }
}

fn split_columns(line: &str) -> Vec<String> {
    COLUMN_GAP
        .split(line.trim())
        .filter(|cell| !cell.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_separator(line: &str) -> bool {
    line.contains('-') && line.chars().all(|c| c == '-' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_header_separator_and_rows() {
        let rows: Vec<Row> = TableParser::default().parse("a  b\n--  --\n1  2\n").collect();
        assert_eq!(rows, vec![row(&[("a", "1"), ("b", "2")])]);
    }

    #[test]
    fn drops_rows_with_mismatched_column_count() {
        let rows: Vec<Row> = TableParser::default()
            .parse("a  b\n--  --\n1  2  3\n4  5\n6\n")
            .collect();
        assert_eq!(rows, vec![row(&[("a", "4"), ("b", "5")])]);
    }

    #[test]
    fn single_spaces_stay_inside_a_cell() {
        let text = "\
metric_time__month    customer name     revenue
--------------------  ---------------  ---------
2024-01-01T00:00:00   Acme Corp           1200.5
2024-02-01T00:00:00   Globex Inc            980
";
        let rows: Vec<Row> = TableParser::default().parse(text).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["customer name"], "Acme Corp");
        assert_eq!(rows[0]["metric_time__month"], "2024-01-01T00:00:00");
        assert_eq!(rows[1]["revenue"], "980");
    }

    #[test]
    fn skips_spinner_and_banner_lines() {
        let text = "\
⠋ Initiating query…
✔ Success 🦄 - query completed after 0.41 seconds
metric_time__day      orders
-------------------  --------
2024-03-01                 17
";
        let rows: Vec<Row> = TableParser::default().parse(text).collect();
        assert_eq!(rows, vec![row(&[("metric_time__day", "2024-03-01"), ("orders", "17")])]);
    }

    #[test]
    fn data_starts_on_second_line_without_separator() {
        let rows: Vec<Row> = TableParser::default().parse("x  y\n1  2\n3  4").collect();
        assert_eq!(
            rows,
            vec![row(&[("x", "1"), ("y", "2")]), row(&[("x", "3"), ("y", "4")])]
        );
    }

    #[test]
    fn trailing_rule_does_not_swallow_rows() {
        let rows: Vec<Row> = TableParser::default()
            .parse("a  b\n1  2\n3  4\n-----")
            .collect();
        assert_eq!(
            rows,
            vec![row(&[("a", "1"), ("b", "2")]), row(&[("a", "3"), ("b", "4")])]
        );

        let framed = "a  b\n--  --\n1  2\n--  --\n3  4\n--  --\n";
        assert_eq!(TableParser::default().parse(framed).count(), 2);
    }

    #[test]
    fn rows_keep_header_column_order() {
        let rows: Vec<Row> = TableParser::default()
            .parse("zeta  alpha  mid\n----  -----  ---\n1  2  3")
            .collect();
        assert_eq!(rows[0].columns().collect::<Vec<_>>(), ["zeta", "alpha", "mid"]);
        assert_eq!(
            serde_json::to_string(&rows[0]).unwrap(),
            r#"{"zeta":"1","alpha":"2","mid":"3"}"#
        );
        assert_eq!(rows[0].get("alpha"), Some("2"));
        assert_eq!(rows[0].get("missing"), None);
    }

    #[test]
    fn empty_or_header_only_input_yields_nothing() {
        let parser = TableParser::default();
        assert_eq!(parser.parse("").count(), 0);
        assert_eq!(parser.parse("\n\n   \n").count(), 0);
        assert_eq!(parser.parse("a  b\n-----  -----\n").count(), 0);
    }

    #[test]
    fn extra_markers_are_applied() {
        let parser = TableParser::new(["Compiling"]);
        let rows: Vec<Row> = parser.parse("Compiling manifest\nk  v\n1  2").collect();
        assert_eq!(rows, vec![row(&[("k", "1"), ("v", "2")])]);
        assert!(parser.noise_markers().iter().any(|m| m == "Success"));
    }
}
