//! Filter grammar shared by `retrieve_memories`, `random_memory`, and
//! `memory_stats` (§4.5): fuzzy, case-insensitive substring matching on
//! labels and source, with `!`-prefixed exclusions.
//!
//! `labels` is a GIN-style array column stored as a JSON text blob, so
//! fuzzy label matching is implemented as `EXISTS` over `json_each` rather
//! than a native array-containment operator.

use crate::types::LabelFilter;

/// A SQL `WHERE` fragment plus the positional parameters it references,
/// built against a `memories`-aliased table (`m`).
pub struct FilterClause {
    pub sql: String,
    pub params: Vec<String>,
}

impl FilterClause {
    fn always_true() -> Self {
        Self {
            sql: "1=1".to_string(),
            params: Vec::new(),
        }
    }
}

/// Build the label predicate: `(include1 OR include2 OR ...) AND NOT exclude1 AND NOT exclude2 ...`.
/// An empty filter matches everything.
pub fn label_predicate(filter: &LabelFilter, table_alias: &str) -> FilterClause {
    if filter.is_empty() {
        return FilterClause::always_true();
    }

    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if !filter.include.is_empty() {
        let mut ors = Vec::new();
        for term in &filter.include {
            ors.push(label_fuzzy_exists(table_alias));
            params.push(format!("%{}%", term.to_lowercase()));
        }
        clauses.push(format!("({})", ors.join(" OR ")));
    }

    for term in &filter.exclude {
        clauses.push(format!("NOT {}", label_fuzzy_exists(table_alias)));
        params.push(format!("%{}%", term.to_lowercase()));
    }

    FilterClause {
        sql: clauses.join(" AND "),
        params,
    }
}

fn label_fuzzy_exists(table_alias: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM json_each({table_alias}.labels) je WHERE lower(je.value) LIKE ? ESCAPE '\\')"
    )
}

/// Build the source predicate: a single fuzzy term, optionally `!`-negated.
/// An empty/absent term matches everything.
pub fn source_predicate(raw: &str, table_alias: &str) -> FilterClause {
    let term = raw.trim();
    if term.is_empty() {
        return FilterClause::always_true();
    }

    if let Some(rest) = term.strip_prefix('!') {
        if rest.is_empty() {
            return FilterClause::always_true();
        }
        FilterClause {
            sql: format!(
                "({alias}.source IS NULL OR lower({alias}.source) NOT LIKE ?)",
                alias = table_alias
            ),
            params: vec![format!("%{}%", rest.to_lowercase())],
        }
    } else {
        FilterClause {
            sql: format!(
                "({alias}.source IS NOT NULL AND lower({alias}.source) LIKE ?)",
                alias = table_alias
            ),
            params: vec![format!("%{}%", term.to_lowercase())],
        }
    }
}

/// Combine the label and source predicates with `AND`, collecting params in
/// the order the generated SQL references them (labels first, then source).
pub fn combine(label: FilterClause, source: FilterClause) -> FilterClause {
    let sql = format!("({}) AND ({})", label.sql, source.sql);
    let mut params = label.params;
    params.extend(source.params);
    FilterClause { sql, params }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::{params_from_iter, Connection};

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "CREATE TABLE m (id INTEGER PRIMARY KEY, labels TEXT, source TEXT);
             INSERT INTO m (id, labels, source) VALUES
                (1, '[\"beer\",\"ale\"]', 'brewday'),
                (2, '[\"wine\",\"red\"]', 'cellar'),
                (3, '[\"beer\",\"stout\"]', NULL);",
        )
        .unwrap();
    }

    #[test]
    fn label_include_or_exclude() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn);
        let filter = LabelFilter::parse("beer,!stout");
        let clause = label_predicate(&filter, "m");
        let sql = format!("SELECT id FROM m WHERE {}", clause.sql);
        let mut stmt = conn.prepare(&sql).unwrap();
        let ids: Vec<i64> = stmt
            .query_map(params_from_iter(clause.params.iter()), |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn source_fuzzy_match() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn);
        let clause = source_predicate("brew", "m");
        let sql = format!("SELECT id FROM m WHERE {}", clause.sql);
        let mut stmt = conn.prepare(&sql).unwrap();
        let ids: Vec<i64> = stmt
            .query_map(params_from_iter(clause.params.iter()), |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn source_negated_includes_null() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn);
        let clause = source_predicate("!brew", "m");
        let sql = format!("SELECT id FROM m WHERE {} ORDER BY id", clause.sql);
        let mut stmt = conn.prepare(&sql).unwrap();
        let ids: Vec<i64> = stmt
            .query_map(params_from_iter(clause.params.iter()), |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let clause = label_predicate(&LabelFilter::default(), "m");
        assert_eq!(clause.sql, "1=1");
        assert!(clause.params.is_empty());
    }
}
