use crate::access::{AccessType, IndexUse};
use crate::engine::{PushConfig, PUSH_STATS};
use crate::expr::Value;
use crate::pushed_join::{FieldValues, PushedJoin};
use crate::query_def::{InstanceError, OpId, QueryInstance};
use crate::table_map::TableNo;
use log::{debug, info};
use std::sync::Arc;

/// Storage engine handle of one plan table. Records which pushed join the table is part of.
#[derive(Debug, Clone)]
pub struct TableHandler {
    tab_no: TableNo,
    alias: String,
    pushed_join: Option<Arc<PushedJoin>>,
    op: OpId,
}

impl TableHandler {
    pub fn new(tab_no: TableNo, alias: impl Into<String>) -> Self {
        Self {
            tab_no,
            alias: alias.into(),
            pushed_join: None,
            op: 0,
        }
    }

    pub fn tab_no(&self) -> TableNo {
        self.tab_no
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn set_pushed_join_member(&mut self, join: Arc<PushedJoin>, op: OpId) {
        self.pushed_join = Some(join);
        self.op = op;
    }

    pub fn clear_pushed_join(&mut self) {
        self.pushed_join = None;
        self.op = 0;
    }

    pub fn member_of_pushed_join(&self) -> Option<&Arc<PushedJoin>> {
        self.pushed_join.as_ref()
    }

    pub fn pushed_op(&self) -> Option<OpId> {
        self.pushed_join.as_ref().map(|_| self.op)
    }

    pub fn is_pushed_root(&self) -> bool {
        self.pushed_op() == Some(0)
    }

    /// Checks before each execution whether the pushed join rooted at this table can be used
    /// with the access the table is read by now.
    pub fn check_if_pushable(
        &self,
        config: &PushConfig,
        access_type: AccessType,
        index: Option<IndexUse>,
        need_sorted: bool,
        fields: &dyn FieldValues,
    ) -> bool {
        let join = match &self.pushed_join {
            Some(join) if self.op == 0 => join,
            _ => return false,
        };
        if !config.enabled {
            debug!("Join pushdown is disabled, executing '{}' unpushed", self.alias);
            return false;
        }
        if need_sorted && join.has_scan_children() {
            info!(
                "Can't push join with root '{}', sorted rows were requested and the join has scan children",
                self.alias
            );
            count_dropped();
            return false;
        }
        if !join.match_definition(access_type, index, fields) {
            info!(
                "Pushed join@{} with root '{}' does not match its definition",
                join.join_no(),
                self.alias
            );
            count_dropped();
            return false;
        }
        true
    }

    /// Instantiates the pushed join rooted at this table for one execution.
    pub fn create_pushed_join(
        &self,
        key_params: &[Value],
        stmt_params: &[Value],
        fields: &dyn FieldValues,
    ) -> Result<QueryInstance, InstanceError> {
        let join = match &self.pushed_join {
            Some(join) if self.op == 0 => join,
            _ => return Err(InstanceError::NotPushedRoot(self.alias.clone())),
        };
        let instance = join.make_query_instance(key_params, stmt_params, fields)?;
        PUSH_STATS.with(|stats| stats.borrow_mut().pushed_queries_executed += 1);
        Ok(instance)
    }

    pub fn explain_extra(&self) -> Option<String> {
        self.pushed_join.as_ref().and_then(|join| join.explain(self.op))
    }
}

fn count_dropped() {
    PUSH_STATS.with(|stats| stats.borrow_mut().pushed_queries_dropped += 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::InterpretedCondPushdown;
    use crate::engine::PushEngine;
    use crate::expr::FieldRef;
    use crate::test_utils;
    use pretty_assertions::assert_eq;
    use rustc_hash::FxHashMap;

    #[test]
    fn root_gates_execution() {
        let plan = test_utils::lookup_with_scan_child();
        let engine = PushEngine::new();
        engine.reset_stats();
        let mut handlers = engine.make_handlers(&plan);
        engine
            .push_joins(&plan, &InterpretedCondPushdown, &mut handlers)
            .unwrap();

        let fields: FxHashMap<FieldRef, Value> = FxHashMap::default();
        let config = engine.config();
        let (root, child) = (&handlers[0], &handlers[1]);
        assert!(root.is_pushed_root());
        assert_eq!(child.pushed_op(), Some(1));
        assert!(!child.check_if_pushable(
            config,
            AccessType::OrderedIndexScan,
            None,
            false,
            &fields
        ));
        assert!(root.check_if_pushable(
            config,
            AccessType::PrimaryKey,
            Some(IndexUse::Primary),
            false,
            &fields
        ));
        assert!(!root.check_if_pushable(
            config,
            AccessType::PrimaryKey,
            Some(IndexUse::Primary),
            true,
            &fields
        ));
        let disabled = PushConfig::default().set_enabled(false);
        assert!(!root.check_if_pushable(
            &disabled,
            AccessType::PrimaryKey,
            Some(IndexUse::Primary),
            false,
            &fields
        ));

        let instance = root
            .create_pushed_join(&[Value::Long(7)], &[], &fields)
            .unwrap();
        assert_eq!(instance.params(), &[Value::Long(7)]);
        assert_eq!(
            child.create_pushed_join(&[Value::Long(7)], &[], &fields).unwrap_err(),
            InstanceError::NotPushedRoot("t2".to_string())
        );

        let stats = engine.stats();
        assert_eq!(stats.pushed_queries_dropped, 1);
        assert_eq!(stats.pushed_queries_executed, 1);
    }

    #[test]
    fn explain_extra_text() {
        let plan = test_utils::three_way_join("ordered_index_scan");
        let engine = PushEngine::new();
        let mut handlers = engine.make_handlers(&plan);
        engine
            .push_joins(&plan, &InterpretedCondPushdown, &mut handlers)
            .unwrap();
        let explain: Vec<_> = handlers
            .iter()
            .map(|handler| handler.explain_extra().unwrap_or_default())
            .collect();
        assert_eq!(
            explain,
            vec![
                "Parent of 3 pushed join@0",
                "Child of 't1' in pushed join@0",
                "Child of 't2' in pushed join@0"
            ]
        );

        let mut handler = handlers[2].clone();
        handler.clear_pushed_join();
        assert_eq!(handler.explain_extra(), None);
        assert!(!handler.is_pushed_root());
    }
}
