use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON text column into `T`.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tome_core::run::RunOutcome;

    #[test]
    fn parse_enum_reports_column() {
        let err = parse_enum::<RunOutcome>("exploded", "runs", "outcome").unwrap_err();
        match err {
            StoreError::CorruptRow { table, column, detail } => {
                assert_eq!(table, "runs");
                assert_eq!(column, "outcome");
                assert!(detail.contains("exploded"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn parse_json_rejects_garbage() {
        assert!(parse_json::<Vec<String>>("[\"a\"]", "jobs", "items").is_ok());
        assert!(parse_json::<Vec<String>>("{", "jobs", "items").is_err());
    }
}
