//! Natural-language rendering of SQL result rows
//!
//! Raw result sets read poorly in a chat answer, so rows are rendered
//! into short enumeration prose. The shape of the output follows the
//! shape of the result: one cell becomes a direct answer, one column
//! becomes a deduplicated list, and wider results become bullet lines
//! with repeated aggregate columns lifted into a one-line summary.

use tandem_common::db::{CellValue, TableRow};

/// Column-name tokens marking a computed aggregate.
const AGGREGATE_TOKENS: &[&str] = &["_total_", "total_", "_sum_", "_count_", "_avg_"];

/// Column names marking a fixture row with teams and scores.
const MATCH_COLUMNS: &[&str] = &["home_team", "away_team", "home_score", "away_score"];

/// Render a deduplicated result set into answer prose. Empty input
/// renders as an empty string; the pipeline treats that as no results.
pub fn format_rows(rows: &[TableRow]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };

    if rows.len() == 1 && first.columns.len() == 1 {
        let (name, value) = &first.columns[0];
        return format_single_value(name, value);
    }
    if first.columns.len() == 1 {
        return format_value_list(rows);
    }
    format_detail(rows, first)
}

/// One bullet line for a row, used for detail listings and for rows the
/// fusion stage appends verbatim.
pub fn row_line(row: &TableRow) -> String {
    if has_match_columns(row) {
        fixture_line(row)
    } else {
        let all: Vec<usize> = (0..row.columns.len()).collect();
        generic_line(row, &all)
    }
}

fn format_single_value(column: &str, value: &CellValue) -> String {
    let lowered = column.to_lowercase();
    if lowered.contains("percentage") || lowered.contains("percent") {
        format!("The answer is: {value}%")
    } else {
        format!("The answer is: {value}")
    }
}

/// Single-column results read as a list; repeated values collapse to
/// their first occurrence.
fn format_value_list(rows: &[TableRow]) -> String {
    let mut seen: Vec<String> = Vec::new();
    for row in rows {
        let Some((_, value)) = row.columns.first() else {
            continue;
        };
        if matches!(value, CellValue::Null) {
            continue;
        }
        let cleaned = clean_cell(value);
        if cleaned.is_empty() || seen.contains(&cleaned) {
            continue;
        }
        seen.push(cleaned);
    }

    match seen.len() {
        0 => String::new(),
        1 => format!("The answer is: {}", seen[0]),
        2 => format!("The answers are: {} and {}", seen[0], seen[1]),
        _ => {
            let head = seen[..seen.len() - 1].join(", ");
            format!("The answers are: {}, and {}", head, seen[seen.len() - 1])
        }
    }
}

fn format_detail(rows: &[TableRow], first: &TableRow) -> String {
    let (aggregate_cols, detail_cols) = split_aggregates(rows, first);
    if !aggregate_cols.is_empty() && !detail_cols.is_empty() {
        return format_with_aggregates(rows, first, &aggregate_cols, &detail_cols);
    }

    // Year-value pairs read better as a plain year list.
    if first.columns.len() == 2 {
        if let Some(year_idx) = first
            .columns
            .iter()
            .position(|(name, _)| name.to_lowercase().contains("year"))
        {
            let value_idx = 1 - year_idx;
            return rows
                .iter()
                .map(|row| {
                    let year = row
                        .columns
                        .get(year_idx)
                        .map(|(_, v)| clean_cell(v))
                        .unwrap_or_default();
                    let value = row
                        .columns
                        .get(value_idx)
                        .map(|(_, v)| clean_cell(v))
                        .unwrap_or_default();
                    format!("* {year}: {value}")
                })
                .collect::<Vec<_>>()
                .join("\n");
        }
    }

    rows.iter().map(row_line).collect::<Vec<_>>().join("\n")
}

/// An aggregate computed per group but selected alongside detail rows
/// repeats its value on every row. Showing it once reads far better,
/// and keeps the fusion model from echoing it per row.
fn split_aggregates(rows: &[TableRow], first: &TableRow) -> (Vec<usize>, Vec<usize>) {
    let mut aggregates = Vec::new();
    let mut details = Vec::new();
    for (idx, (name, _)) in first.columns.iter().enumerate() {
        let lowered = name.to_lowercase();
        let aggregate_name = AGGREGATE_TOKENS.iter().any(|token| lowered.contains(token));
        if aggregate_name && column_constant(rows, idx) {
            aggregates.push(idx);
        } else {
            details.push(idx);
        }
    }
    (aggregates, details)
}

fn column_constant(rows: &[TableRow], idx: usize) -> bool {
    let mut values = rows.iter().filter_map(|row| row.columns.get(idx).map(|(_, v)| v));
    let Some(first) = values.next() else {
        return false;
    };
    values.all(|value| value == first)
}

fn format_with_aggregates(
    rows: &[TableRow],
    first: &TableRow,
    aggregate_cols: &[usize],
    detail_cols: &[usize],
) -> String {
    let summary = aggregate_cols
        .iter()
        .filter_map(|&idx| first.columns.get(idx))
        .map(|(name, value)| format!("{}: {}", clean_label(name), value))
        .collect::<Vec<_>>()
        .join(", ");

    let mut lines = vec![
        format!("Overall Statistics: {summary}"),
        String::new(),
        "Details:".to_string(),
    ];
    let fixture = detail_cols.iter().any(|&idx| {
        first
            .columns
            .get(idx)
            .map(|(name, _)| MATCH_COLUMNS.contains(&name.to_lowercase().as_str()))
            .unwrap_or(false)
    });
    for row in rows {
        if fixture {
            lines.push(fixture_line(row));
        } else {
            lines.push(generic_line(row, detail_cols));
        }
    }
    lines.join("\n")
}

fn has_match_columns(row: &TableRow) -> bool {
    row.columns
        .iter()
        .any(|(name, _)| MATCH_COLUMNS.contains(&name.to_lowercase().as_str()))
}

/// "1950, Final Group, Uruguay 2-1 Brazil" style line.
fn fixture_line(row: &TableRow) -> String {
    let mut parts = Vec::new();
    if let Some(year) = non_null(row.get("Year")) {
        parts.push(clean_cell(year));
    }
    if let Some(round) = non_null(row.get("Round")) {
        parts.push(clean_cell(round));
    }

    let home_team = non_null(row.get("Home_Team"));
    let away_team = non_null(row.get("Away_Team"));
    let home_score = non_null(row.get("Home_Score"));
    let away_score = non_null(row.get("Away_Score"));
    let opponent = non_null(row.get("Opponent"));

    match (home_team, away_team, home_score, away_score) {
        (Some(home), Some(away), Some(hs), Some(aws)) => {
            parts.push(format!(
                "{} {}-{} {}",
                clean_cell(home),
                clean_cell(hs),
                clean_cell(aws),
                clean_cell(away)
            ));
        }
        _ => {
            if let (Some(opp), Some(hs), Some(aws)) = (opponent, home_score, away_score) {
                parts.push(format!(
                    "vs {} ({}-{})",
                    clean_cell(opp),
                    clean_cell(hs),
                    clean_cell(aws)
                ));
            } else if let Some(opp) = opponent {
                parts.push(format!("vs {}", clean_cell(opp)));
            }
        }
    }
    format!("* {}", parts.join(", "))
}

fn generic_line(row: &TableRow, cols: &[usize]) -> String {
    let mut cells = Vec::new();
    for &idx in cols {
        let Some((name, value)) = row.columns.get(idx) else {
            continue;
        };
        if matches!(value, CellValue::Null) {
            continue;
        }
        let cleaned = clean_cell(value);
        if cleaned.is_empty() {
            continue;
        }
        let lowered = name.to_lowercase();
        if lowered.contains("year") || lowered.contains("round") {
            cells.push(cleaned);
        } else {
            cells.push(format!("{name}: {cleaned}"));
        }
    }
    format!("* {}", cells.join(", "))
}

fn non_null(value: Option<&CellValue>) -> Option<&CellValue> {
    value.filter(|v| !matches!(v, CellValue::Null))
}

fn clean_cell(value: &CellValue) -> String {
    value.to_string().replace('\n', " ").trim().to_string()
}

/// "uruguay_total_wins" reads as "Uruguay Wins".
fn clean_label(name: &str) -> String {
    name.split('_')
        .filter(|token| !token.is_empty() && !token.eq_ignore_ascii_case("total"))
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[(&str, CellValue)]) -> TableRow {
        TableRow::new(
            cells
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }

    fn fixture(year: i64, round: &str, home: &str, hs: i64, aws: i64, away: &str) -> TableRow {
        row(&[
            ("Year", CellValue::Int(year)),
            ("Round", CellValue::Text(round.to_string())),
            ("Home_Team", CellValue::Text(home.to_string())),
            ("Home_Score", CellValue::Int(hs)),
            ("Away_Score", CellValue::Int(aws)),
            ("Away_Team", CellValue::Text(away.to_string())),
        ])
    }

    #[test]
    fn test_empty_rows_render_empty() {
        assert_eq!(format_rows(&[]), "");
    }

    #[test]
    fn test_single_cell_is_direct_answer() {
        let rows = vec![row(&[("match_count", CellValue::Int(5))])];
        assert_eq!(format_rows(&rows), "The answer is: 5");
    }

    #[test]
    fn test_percentage_column_gets_suffix() {
        let rows = vec![row(&[("percentage_of_draws", CellValue::Float(24.53))])];
        assert_eq!(format_rows(&rows), "The answer is: 24.53%");
    }

    #[test]
    fn test_single_column_list_deduplicates_in_order() {
        let winners = ["Uruguay", "Italy", "Uruguay", "Brazil", "Italy"];
        let rows: Vec<TableRow> = winners
            .iter()
            .map(|w| row(&[("Winner", CellValue::Text(w.to_string()))]))
            .collect();
        assert_eq!(
            format_rows(&rows),
            "The answers are: Uruguay, Italy, and Brazil"
        );
    }

    #[test]
    fn test_two_value_list_uses_and() {
        let rows = vec![
            row(&[("Winner", CellValue::Text("Uruguay".to_string()))]),
            row(&[("Winner", CellValue::Text("Italy".to_string()))]),
        ];
        assert_eq!(format_rows(&rows), "The answers are: Uruguay and Italy");
    }

    #[test]
    fn test_list_collapsing_to_one_value() {
        let rows = vec![
            row(&[("Winner", CellValue::Text("Uruguay".to_string()))]),
            row(&[("Winner", CellValue::Text("Uruguay".to_string()))]),
            row(&[("Winner", CellValue::Null)]),
        ];
        assert_eq!(format_rows(&rows), "The answer is: Uruguay");
    }

    #[test]
    fn test_repeated_aggregate_lifted_into_summary() {
        let mut rows = Vec::new();
        for (year, home, hs, aws, away) in [
            (1930, "Uruguay", 4, 2, "Argentina"),
            (1950, "Uruguay", 2, 1, "Brazil"),
        ] {
            let mut fixture = fixture(year, "Final", home, hs, aws, away);
            fixture
                .columns
                .push(("uruguay_total_wins".to_string(), CellValue::Int(15)));
            rows.push(fixture);
        }

        let text = format_rows(&rows);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Overall Statistics: Uruguay Wins: 15");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "Details:");
        assert_eq!(lines[3], "* 1930, Final, Uruguay 4-2 Argentina");
        assert_eq!(lines[4], "* 1950, Final, Uruguay 2-1 Brazil");
        // The aggregate value appears exactly once.
        assert_eq!(text.matches("15").count(), 1);
    }

    #[test]
    fn test_varying_aggregate_column_stays_in_details() {
        let rows = vec![
            row(&[
                ("Year", CellValue::Int(1930)),
                ("total_goals", CellValue::Int(70)),
            ]),
            row(&[
                ("Year", CellValue::Int(1934)),
                ("total_goals", CellValue::Int(70)),
            ]),
            row(&[
                ("Year", CellValue::Int(1938)),
                ("total_goals", CellValue::Int(84)),
            ]),
        ];
        // Values differ across rows, so the year-value branch applies.
        let text = format_rows(&rows);
        assert_eq!(text, "* 1930: 70\n* 1934: 70\n* 1938: 84");
    }

    #[test]
    fn test_year_value_pairs() {
        let rows = vec![
            row(&[
                ("Year", CellValue::Int(1930)),
                ("goals", CellValue::Int(70)),
            ]),
            row(&[
                ("Year", CellValue::Int(1934)),
                ("goals", CellValue::Int(70)),
            ]),
        ];
        assert_eq!(format_rows(&rows), "* 1930: 70\n* 1934: 70");
    }

    #[test]
    fn test_row_line_fixture_shape() {
        let line = row_line(&fixture(1950, "Final Group", "Uruguay", 2, 1, "Brazil"));
        assert_eq!(line, "* 1950, Final Group, Uruguay 2-1 Brazil");
    }

    #[test]
    fn test_row_line_opponent_shape() {
        let line = row_line(&row(&[
            ("Year", CellValue::Int(1954)),
            ("Opponent", CellValue::Text("Hungary".to_string())),
            ("Home_Score", CellValue::Int(4)),
            ("Away_Score", CellValue::Int(2)),
        ]));
        assert_eq!(line, "* 1954, vs Hungary (4-2)");
    }

    #[test]
    fn test_row_line_generic_labels_cells() {
        let line = row_line(&row(&[
            ("Year", CellValue::Int(1966)),
            ("Stadium", CellValue::Text("Wembley".to_string())),
            ("Attendance", CellValue::Int(96924)),
        ]));
        assert_eq!(line, "* 1966, Stadium: Wembley, Attendance: 96924");
    }

    #[test]
    fn test_generic_rows_skip_null_cells() {
        let rows = vec![
            row(&[
                ("City", CellValue::Text("Montevideo".to_string())),
                ("Stadium", CellValue::Text("Centenario".to_string())),
                ("Capacity", CellValue::Null),
            ]),
            row(&[
                ("City", CellValue::Text("Rio".to_string())),
                ("Stadium", CellValue::Text("Maracana".to_string())),
                ("Capacity", CellValue::Int(173850)),
            ]),
        ];
        let text = format_rows(&rows);
        assert_eq!(
            text,
            "* City: Montevideo, Stadium: Centenario\n\
             * City: Rio, Stadium: Maracana, Capacity: 173850"
        );
    }

    #[test]
    fn test_clean_label_drops_total_token() {
        assert_eq!(clean_label("uruguay_total_wins"), "Uruguay Wins");
        assert_eq!(clean_label("match_count"), "Match Count");
    }
}
