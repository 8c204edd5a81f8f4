use crate::access::QueryPlan;
use crate::cond::CondPushdown;
use crate::handler::TableHandler;
use crate::push::{self, NoPushReason, PushError, PushedBuilderCtx};
use crate::pushed_join::PushedJoin;
use crate::table_map::TableMap;
use log::{debug, info};
use serde::Serialize;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

/// Settings of the join push-down planner.
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub enabled: bool,
    /// Operations the storage nodes can execute in one pushed join.
    pub max_operations: usize,
    pub max_key_parts: usize,
    /// Fields of tables before the root a pushed join may refer to.
    pub max_referred_fields: usize,
    pub max_linked_cond_params: usize,
    /// Whether the storage nodes can evaluate outer and semi joined scans.
    pub outer_joined_scans: bool,
    pub root_fragments: usize,
    pub few_rows_ratio: f64,
    pub parallelism_gain: f64,
    pub print_plan: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_operations: 32,
            max_key_parts: 16,
            max_referred_fields: 16,
            max_linked_cond_params: 16,
            outer_joined_scans: true,
            root_fragments: 8,
            few_rows_ratio: 0.75,
            parallelism_gain: 4.0,
            print_plan: false,
        }
    }
}

impl PushConfig {
    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_operations(mut self, max_operations: usize) -> Self {
        self.max_operations = max_operations;
        self
    }

    pub fn with_max_key_parts(mut self, max_key_parts: usize) -> Self {
        self.max_key_parts = max_key_parts;
        self
    }

    pub fn with_max_referred_fields(mut self, max_referred_fields: usize) -> Self {
        self.max_referred_fields = max_referred_fields;
        self
    }

    pub fn with_max_linked_cond_params(mut self, max_linked_cond_params: usize) -> Self {
        self.max_linked_cond_params = max_linked_cond_params;
        self
    }

    pub fn set_outer_joined_scans(mut self, outer_joined_scans: bool) -> Self {
        self.outer_joined_scans = outer_joined_scans;
        self
    }

    pub fn with_root_fragments(mut self, root_fragments: usize) -> Self {
        self.root_fragments = root_fragments;
        self
    }

    pub fn with_few_rows_ratio(mut self, few_rows_ratio: f64) -> Self {
        self.few_rows_ratio = few_rows_ratio;
        self
    }

    pub fn with_parallelism_gain(mut self, parallelism_gain: f64) -> Self {
        self.parallelism_gain = parallelism_gain;
        self
    }
}

#[derive(Default, Clone, Debug, PartialEq, Serialize)]
pub struct PushStats {
    pub pushed_queries_defined: u64,
    pub pushed_queries_dropped: u64,
    pub pushed_queries_executed: u64,
    pub pushed_tables: u64,
    pub rejected_tables: u64,
}

thread_local! {
    pub static PUSH_STATS: RefCell<PushStats> = RefCell::new(Default::default());
}

/// Pushed joins of one statement and why the other tables were not pushed.
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub joins: Vec<Arc<PushedJoin>>,
    pub explain: Vec<NoPushReason>,
}

#[derive(Debug, Default)]
pub struct PushEngine {
    config: PushConfig,
}

impl PushEngine {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_config(config: PushConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) -> &mut Self {
        self.config.enabled = enabled;
        self
    }

    pub fn set_print_plan(&mut self, print_plan: bool) -> &mut Self {
        self.config.print_plan = print_plan;
        self
    }

    pub fn set_outer_joined_scans(&mut self, outer_joined_scans: bool) -> &mut Self {
        self.config.outer_joined_scans = outer_joined_scans;
        self
    }

    pub fn with_max_operations(&mut self, max_operations: usize) -> &mut Self {
        self.config.max_operations = max_operations;
        self
    }

    pub fn with_root_fragments(&mut self, root_fragments: usize) -> &mut Self {
        self.config.root_fragments = root_fragments;
        self
    }

    pub fn stats(&self) -> PushStats {
        PUSH_STATS.with(|stats| stats.borrow().clone())
    }

    pub fn reset_stats(&self) {
        PUSH_STATS.with(|stats| *stats.borrow_mut() = Default::default());
    }

    pub fn make_handlers(&self, plan: &QueryPlan) -> Vec<TableHandler> {
        plan.tables()
            .iter()
            .enumerate()
            .map(|(tab_no, access)| TableHandler::new(tab_no, access.alias.clone()))
            .collect()
    }

    /// Plans the pushed joins of a statement, trying each table as root in plan order. The
    /// handlers of all tables in a pushed join are tagged with it. On error no handler stays
    /// tagged and the statement is executed unpushed.
    pub fn push_joins(
        &self,
        plan: &QueryPlan,
        cond_pushdown: &dyn CondPushdown,
        handlers: &mut [TableHandler],
    ) -> push::Result<PushOutcome> {
        if handlers.len() != plan.len() {
            return Err(PushError::Internal(format!(
                "{} handlers for {} plan tables",
                handlers.len(),
                plan.len()
            )));
        }
        for handler in handlers.iter_mut() {
            handler.clear_pushed_join();
        }
        if !self.config.enabled {
            debug!("Join pushdown is disabled");
            return Ok(Default::default());
        }

        let now = Instant::now();
        let mut ctx = PushedBuilderCtx::new(plan, &self.config, cond_pushdown);
        let mut joins: Vec<Arc<PushedJoin>> = vec![];
        for root in 0..plan.len() {
            if ctx.pushed_members().contain(root) {
                continue;
            }
            match ctx.make_pushed_join(root, joins.len()) {
                Ok(Some(join)) => {
                    for (op, &tab_no) in join.tables().iter().enumerate() {
                        handlers[tab_no].set_pushed_join_member(join.clone(), op);
                    }
                    joins.push(join);
                }
                Ok(None) => {}
                Err(err) => {
                    info!("Pushing join with root '{}' failed: {}", plan.table(root).alias, err);
                    for handler in handlers.iter_mut() {
                        handler.clear_pushed_join();
                    }
                    return Err(err);
                }
            }
        }
        let explain = ctx.take_explain();
        debug!(
            "Planned {} pushed joins in {} us",
            joins.len(),
            now.elapsed().as_micros()
        );

        let rejected: TableMap = explain.iter().map(|reason| reason.table).collect();
        PUSH_STATS.with(|stats| {
            let mut stats = stats.borrow_mut();
            stats.pushed_queries_defined += joins.len() as u64;
            stats.pushed_tables += joins
                .iter()
                .map(|join| join.operation_count() as u64)
                .sum::<u64>();
            stats.rejected_tables += rejected.difference(ctx.pushed_members()).len() as u64;
        });

        if self.config.print_plan {
            for join in &joins {
                println!("{}", join);
            }
        }
        Ok(PushOutcome { joins, explain })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::{CondSplit, InterpretedCondPushdown};
    use crate::expr::Expr;
    use crate::test_utils::{self, build_plan};
    use crate::table_map::TableNo;
    use pretty_assertions::assert_eq;

    /// Pushes every condition unchanged, including references the storage nodes can't resolve.
    struct PushEverything;

    impl CondPushdown for PushEverything {
        fn push_cond(&self, cond: &Expr, _tab_no: TableNo, _allowed: TableMap) -> CondSplit {
            CondSplit {
                pushed: Some(cond.clone()),
                remainder: None,
            }
        }
    }

    #[test]
    fn tags_handlers_and_counts() {
        let plan = test_utils::three_way_join("ordered_index_scan");
        let engine = PushEngine::new();
        engine.reset_stats();
        let mut handlers = engine.make_handlers(&plan);
        let outcome = engine
            .push_joins(&plan, &InterpretedCondPushdown, &mut handlers)
            .unwrap();
        assert_eq!(outcome.joins.len(), 1);
        assert!(outcome.explain.is_empty());
        let ops: Vec<_> = handlers.iter().map(|handler| handler.pushed_op()).collect();
        assert_eq!(ops, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(
            engine.stats(),
            PushStats {
                pushed_queries_defined: 1,
                pushed_tables: 3,
                ..Default::default()
            }
        );
    }

    #[test]
    fn disabled_engine_pushes_nothing() {
        let plan = test_utils::three_way_join("ordered_index_scan");
        let mut engine = PushEngine::new();
        engine.set_enabled(false);
        let mut handlers = engine.make_handlers(&plan);
        let outcome = engine
            .push_joins(&plan, &InterpretedCondPushdown, &mut handlers)
            .unwrap();
        assert!(outcome.joins.is_empty());
        assert!(handlers.iter().all(|handler| handler.member_of_pushed_join().is_none()));
    }

    #[test]
    fn rejected_tables_counted_once() {
        let plan = test_utils::three_way_join("undecided");
        let engine = PushEngine::new();
        engine.reset_stats();
        let mut handlers = engine.make_handlers(&plan);
        let outcome = engine
            .push_joins(&plan, &InterpretedCondPushdown, &mut handlers)
            .unwrap();
        assert!(outcome.joins.is_empty());
        assert_eq!(engine.stats().rejected_tables, 2);
    }

    #[test]
    fn failed_assembly_clears_all_tags() {
        // The condition of t3 refers t4, which comes later in the plan.
        let plan = build_plan(
            "CREATE TABLE t (pk INT PRIMARY KEY, a INT, KEY ix_a (a));
             ACCESS t AS t0 table_scan ROWS 100;
             ACCESS t AS t1 primary_key INDEX PRIMARY KEY (t0.a);
             ACCESS t AS t2 table_scan ROWS 100 SELECT 2;
             ACCESS t AS t3 primary_key INDEX PRIMARY KEY (t2.a) COND (t3.a = t4.a) SELECT 2;
             ACCESS t AS t4 primary_key INDEX PRIMARY KEY (t2.a) SELECT 2;",
        );
        let engine = PushEngine::new();
        let mut handlers = engine.make_handlers(&plan);
        let err = engine
            .push_joins(&plan, &PushEverything, &mut handlers)
            .unwrap_err();
        assert!(matches!(err, PushError::Internal(_)));
        assert!(handlers.iter().all(|handler| handler.member_of_pushed_join().is_none()));
    }

    #[test]
    fn handler_count_must_match_plan() {
        let plan = test_utils::lookup_with_scan_child();
        let engine = PushEngine::new();
        let mut handlers = vec![];
        assert!(engine
            .push_joins(&plan, &InterpretedCondPushdown, &mut handlers)
            .is_err());
    }
}
