//! Plans shared by the tests of several modules. Failing to parse a plan panics.
use crate::access::QueryPlan;
use crate::parse::Parser;

pub fn build_plan(text: &str) -> QueryPlan {
    match Parser::new().parse(text) {
        Ok(plan) => plan,
        Err(err) => panic!("Could not parse plan: {}\n{}", err, text),
    }
}

/// Primary key lookup of t1, followed by an index scan of t2 on a column of t1.
pub fn lookup_with_scan_child() -> QueryPlan {
    build_plan(
        "CREATE TABLE t (pk INT PRIMARY KEY, a INT, KEY ix_a (a));
         ACCESS t AS t1 primary_key INDEX PRIMARY KEY (?);
         ACCESS t AS t2 ordered_index_scan INDEX ix_a KEY (t1.pk);",
    )
}

/// Scan of t1, left joined with an index scan of t2 having a condition the storage nodes can't
/// evaluate.
pub fn outer_scan_with_unpushed_cond() -> QueryPlan {
    build_plan(
        "CREATE TABLE t (pk INT PRIMARY KEY, x INT, b INT, c INT, KEY ix_b (b));
         ACCESS t AS t1 table_scan ROWS 100;
         ACCESS t AS t2 ordered_index_scan INDEX ix_b KEY (t1.x) COND (f(t2.c));
         OUTER t2 TO t2;",
    )
}

/// Scan of t1, then t2 read by `t2_access` on a column of t1, then a primary key lookup of t3
/// on columns of both.
pub fn three_way_join(t2_access: &str) -> QueryPlan {
    build_plan(&format!(
        "CREATE TABLE u (pk INT PRIMARY KEY, x INT, y INT);
         CREATE TABLE w (pk INT PRIMARY KEY, a INT, z INT, KEY ix_a (a));
         CREATE TABLE v (b INT, c INT, d INT, PRIMARY KEY (b, c));
         ACCESS u AS t1 table_scan ROWS 100;
         ACCESS w AS t2 {} INDEX ix_a KEY (t1.x);
         ACCESS v AS t3 primary_key INDEX PRIMARY KEY (t1.y, t2.z);",
        t2_access
    ))
}

/// Two scans where the second is the root of a join referring to a field of the first and to
/// statement parameters.
pub fn extern_field_join() -> QueryPlan {
    build_plan(
        "CREATE TABLE t (pk INT PRIMARY KEY, a INT, KEY ix_a (a));
         ACCESS t AS t0 table_scan ROWS 100;
         ACCESS t AS t1 ordered_index_scan INDEX ix_a KEY (?) ROWS 100;
         ACCESS t AS t2 primary_key INDEX PRIMARY KEY (t1.a) COND (t2.a > t0.a AND t2.a < ?);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessType;
    use pretty_assertions::assert_eq;

    #[test]
    fn fixtures_parse() {
        assert_eq!(lookup_with_scan_child().len(), 2);
        assert_eq!(outer_scan_with_unpushed_cond().nests().len(), 1);
        let plan = three_way_join("undecided");
        assert_eq!(plan.table(1).access_type, AccessType::Undecided);
        assert_eq!(plan.table(2).key_fields.len(), 2);
        assert_eq!(extern_field_join().find_table("t2"), Some(2));
    }
}
