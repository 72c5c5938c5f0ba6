// Query engine end-to-end: parse cache, execution semantics and a
// property test of WHERE evaluation against a naive reference.

mod common;

use common::*;
use proptest::prelude::*;
use std::sync::Arc;
use tabula_core::engine::PlanCache;
use tabula_core::sql::QueryExecutor;
use tabula_core::{ExecuteOptions, Row, ScalarValue, TabulaError};

// ─── Helpers ────────────────────────────────────────────

fn run(sql: &str, rows: Vec<Row>) -> tabula_core::sql::ExecutionOutput {
    let plans = PlanCache::new(16);
    let query = plans.parse(sql).unwrap();
    QueryExecutor::new().execute(&query, Arc::new(rows)).unwrap()
}

fn texts(rows: &[Row], field: &str) -> Vec<String> {
    rows.iter().map(|r| r.get(field).as_text()).collect()
}

// ─── Examples ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn orders_top_campaigns() {
    let (_, platform) = platform_with(unbatched_config());
    let result = platform
        .query(
            TENANT,
            "SELECT campaign, COUNT(*) AS n FROM orders WHERE total > 100 GROUP BY campaign ORDER BY n DESC LIMIT 2",
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["campaign", "n"]);
    assert_eq!(result.total_rows, 10);
    assert_eq!(result.filtered_rows, 6);
    assert_eq!(texts(&result.rows, "campaign"), vec!["spring", "summer"]);
    assert_eq!(result.rows[0].get("n"), &ScalarValue::Int64(3));
    assert_eq!(result.rows[1].get("n"), &ScalarValue::Int64(2));
}

#[test]
fn parse_is_idempotent_and_cached() {
    let plans = PlanCache::new(16);
    let sql = "SELECT campaign, SUM(total) FROM orders WHERE total >= 100 GROUP BY campaign";
    let first = plans.parse(sql).unwrap();
    let second = plans.parse(sql).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*first, *second);

    let reformatted = plans
        .parse("select  campaign, sum(total)\nfrom orders where total >= 100 group by campaign;")
        .unwrap();
    assert!(Arc::ptr_eq(&first, &reformatted));

    let stats = plans.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
}

#[test]
fn left_to_right_evaluation() {
    // (campaign = fall OR campaign = summer) AND total > 100
    let out = run(
        "SELECT id FROM orders WHERE campaign = 'fall' OR campaign = 'summer' AND total > 100",
        orders(),
    );
    assert_eq!(texts(&out.rows, "id"), vec!["2", "4", "8"]);
}

#[test]
fn parenthesized_where_is_rejected() {
    let plans = PlanCache::new(4);
    let err = plans
        .parse("SELECT * FROM orders WHERE (total > 1 OR total < 0) AND id = 1")
        .unwrap_err();
    assert!(matches!(err, TabulaError::Parse { ref clause, .. } if clause == "WHERE"));
}

#[test]
fn empty_set_aggregates() {
    let out = run(
        "SELECT COUNT(*), SUM(total), AVG(total), MIN(total), MAX(total) FROM orders WHERE total > 10000",
        orders(),
    );
    assert_eq!(out.rows.len(), 1);
    let row = &out.rows[0];
    assert_eq!(row.get("count"), &ScalarValue::Int64(0));
    assert_eq!(row.get("sum_total"), &ScalarValue::Int64(0));
    assert_eq!(row.get("avg_total"), &ScalarValue::Null);
    assert_eq!(row.get("min_total"), &ScalarValue::Null);
    assert_eq!(row.get("max_total"), &ScalarValue::Null);
}

#[test]
fn distinct_forms() {
    let a = run("SELECT COUNT(DISTINCT campaign) AS c FROM orders", orders());
    let b = run("SELECT DISTINCT(campaign) AS c FROM orders", orders());
    assert_eq!(a.rows[0].get("c"), &ScalarValue::Int64(3));
    assert_eq!(a.rows, b.rows);
}

#[test]
fn like_in_and_null_conditions() {
    let mut rows = orders();
    rows[0].set("note", "VIP customer");
    rows[1].set("note", "");

    let out = run("SELECT id FROM orders WHERE note LIKE '%vip%'", rows.clone());
    assert_eq!(texts(&out.rows, "id"), vec!["1"]);

    let out = run("SELECT id FROM orders WHERE note = NULL AND id IN (1, 2, 3)", rows.clone());
    assert_eq!(texts(&out.rows, "id"), vec!["2", "3"]);

    let out = run("SELECT id FROM orders WHERE campaign NOT IN ('spring', \"fall\")", rows);
    assert_eq!(texts(&out.rows, "id"), vec!["2", "5", "8"]);
}

#[test]
fn text_numbers_filter_and_sort_numerically() {
    // Totals typed into the sheet come back as text.
    let rows: Vec<Row> = [("a", "150"), ("b", "20"), ("c", "99"), ("d", " 7 "), ("e", "n/a")]
        .iter()
        .map(|(id, total)| Row::new().with("id", *id).with("total", *total))
        .collect();

    let out = run("SELECT id FROM orders WHERE total > 50 ORDER BY total DESC", rows[..4].to_vec());
    assert_eq!(texts(&out.rows, "id"), vec!["a", "c"]);

    let out = run("SELECT id FROM orders ORDER BY total", rows);
    assert_eq!(texts(&out.rows, "id"), vec!["d", "b", "c", "a", "e"]);
}

#[test]
fn large_input_keeps_row_order() {
    let rows: Vec<Row> = (0..10_000)
        .map(|i| Row::new().with("i", i as i64).with("odd", i % 2 == 1))
        .collect();
    let out = run("SELECT i FROM big WHERE odd = true", rows);
    assert_eq!(out.filtered_rows, 5_000);
    let values: Vec<i64> = out
        .rows
        .iter()
        .map(|r| match r.get("i") {
            ScalarValue::Int64(i) => *i,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert!(values.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(values[0], 1);
}

// ─── Properties ─────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Op {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

impl Op {
    fn sql(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::NotEq => "!=",
            Op::Gt => ">",
            Op::GtEq => ">=",
            Op::Lt => "<",
            Op::LtEq => "<=",
        }
    }

    fn holds(self, actual: i64, expected: i64) -> bool {
        match self {
            Op::Eq => actual == expected,
            Op::NotEq => actual != expected,
            Op::Gt => actual > expected,
            Op::GtEq => actual >= expected,
            Op::Lt => actual < expected,
            Op::LtEq => actual <= expected,
        }
    }
}

#[derive(Debug, Clone)]
struct Cond {
    field: &'static str,
    op: Op,
    value: i64,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Eq),
        Just(Op::NotEq),
        Just(Op::Gt),
        Just(Op::GtEq),
        Just(Op::Lt),
        Just(Op::LtEq),
    ]
}

fn cond_strategy() -> impl Strategy<Value = Cond> {
    (prop_oneof![Just("a"), Just("b")], op_strategy(), -3i64..8).prop_map(|(field, op, value)| Cond {
        field,
        op,
        value,
    })
}

/// Conditions joined by AND (`true`) / OR (`false`).
fn chain_strategy() -> impl Strategy<Value = (Cond, Vec<(bool, Cond)>)> {
    (
        cond_strategy(),
        prop::collection::vec((any::<bool>(), cond_strategy()), 0..4),
    )
}

fn rows_strategy() -> impl Strategy<Value = Vec<(Option<i64>, Option<i64>)>> {
    prop::collection::vec(
        (prop::option::of(-2i64..6), prop::option::of(-2i64..6)),
        1..40,
    )
}

fn reference(chain: &(Cond, Vec<(bool, Cond)>), a: Option<i64>, b: Option<i64>) -> bool {
    let eval = |c: &Cond| {
        let actual = if c.field == "a" { a } else { b };
        actual.is_some_and(|v| c.op.holds(v, c.value))
    };
    let mut result = eval(&chain.0);
    for (and, cond) in &chain.1 {
        let matched = eval(cond);
        result = if *and { result && matched } else { result || matched };
    }
    result
}

fn to_sql(chain: &(Cond, Vec<(bool, Cond)>)) -> String {
    let fmt = |c: &Cond| format!("{} {} {}", c.field, c.op.sql(), c.value);
    let mut sql = format!("SELECT id FROM t WHERE {}", fmt(&chain.0));
    for (and, cond) in &chain.1 {
        sql.push_str(if *and { " AND " } else { " OR " });
        sql.push_str(&fmt(cond));
    }
    sql
}

proptest! {
    #[test]
    fn where_matches_reference(chain in chain_strategy(), data in rows_strategy()) {
        let rows: Vec<Row> = data
            .iter()
            .enumerate()
            .map(|(i, (a, b))| {
                Row::new()
                    .with("id", i as i64)
                    .with("a", ScalarValue::from(*a))
                    .with("b", ScalarValue::from(*b))
            })
            .collect();
        let expected: Vec<String> = data
            .iter()
            .enumerate()
            .filter(|(_, (a, b))| reference(&chain, *a, *b))
            .map(|(i, _)| i.to_string())
            .collect();

        let out = run(&to_sql(&chain), rows);
        prop_assert_eq!(texts(&out.rows, "id"), expected);
    }

    #[test]
    fn group_counts_sum_to_filtered(
        data in prop::collection::vec((0usize..3, 0i64..300), 0..60),
        threshold in 0i64..300,
    ) {
        let campaigns = ["x", "y", "z"];
        let rows: Vec<Row> = data
            .iter()
            .map(|(c, total)| Row::new().with("campaign", campaigns[*c]).with("total", *total))
            .collect();
        let out = run(
            &format!("SELECT campaign, COUNT(*) AS n FROM orders WHERE total > {threshold} GROUP BY campaign"),
            rows,
        );
        let sum: i64 = out
            .rows
            .iter()
            .map(|r| match r.get("n") {
                ScalarValue::Int64(n) => *n,
                _ => 0,
            })
            .sum();
        prop_assert_eq!(sum as usize, out.filtered_rows);
    }
}
