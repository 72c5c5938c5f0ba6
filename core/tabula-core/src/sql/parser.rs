use crate::error::{TabulaError, TabulaResult};
use crate::sql::planner::{Query, QueryPlanner};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Query text parser backed by sqlparser-rs.
pub struct SqlParser {
    dialect: GenericDialect,
    planner: QueryPlanner,
}

impl SqlParser {
    pub fn new() -> Self {
        Self {
            dialect: GenericDialect {},
            planner: QueryPlanner::new(),
        }
    }

    /// Text to sqlparser AST.
    pub fn parse(&self, sql: &str) -> TabulaResult<Vec<Statement>> {
        Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| TabulaError::parse("syntax", format!("{e} in `{sql}`")))
    }

    /// Text to [`Query`]. Callers that cache should pass [`normalize`]d text.
    pub fn parse_query(&self, sql: &str) -> TabulaResult<Query> {
        let statements = self.parse(sql)?;
        self.planner.plan(&statements)
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical form of query text: whitespace runs collapsed to one space,
/// trailing `;` dropped, everything outside quotes lower-cased.
pub fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        if c == '\'' || c == '"' {
            quote = Some(c);
            out.push(c);
        } else {
            out.extend(c.to_lowercase());
        }
    }

    while out.ends_with(';') || out.ends_with(' ') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_and_lowercases() {
        assert_eq!(
            normalize("  SELECT *\n\tFROM   Orders  WHERE name = 'Mixed  Case' ;; "),
            "select * from orders where name = 'Mixed  Case'"
        );
    }

    #[test]
    fn test_normalize_keeps_double_quoted_text() {
        assert_eq!(
            normalize(r#"SELECT a FROM t WHERE b = "Hello World""#),
            r#"select a from t where b = "Hello World""#
        );
    }

    #[test]
    fn test_normalize_doubled_quote_escape() {
        assert_eq!(
            normalize("SELECT A FROM T WHERE B = 'IT''S'"),
            "select a from t where b = 'IT''S'"
        );
    }

    #[test]
    fn test_parse_query() {
        let parser = SqlParser::new();
        let query = parser
            .parse_query("select campaign, count(*) from orders group by campaign")
            .unwrap();
        assert_eq!(query.table, "orders");
        assert_eq!(query.group_by, vec!["campaign"]);
    }

    #[test]
    fn test_syntax_error() {
        let parser = SqlParser::new();
        let err = parser.parse_query("select from where").unwrap_err();
        assert!(matches!(err, TabulaError::Parse { .. }));
    }
}
