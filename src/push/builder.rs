use super::table::{PushedTable, PUSHABLE_AS_PARENT};
use super::Result;
use crate::access::QueryPlan;
use crate::cond::CondPushdown;
use crate::engine::PushConfig;
use crate::pushed_join::PushedJoin;
use crate::table_map::{TableMap, TableNo};
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Why a table was not made part of a pushed join.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoPushReason {
    pub table: TableNo,
    pub alias: String,
    pub reason: String,
}

/// Planning state of one statement. Created once per plan, `prepare` resets it for each
/// candidate root.
pub struct PushedBuilderCtx<'a> {
    pub(super) plan: &'a QueryPlan,
    pub(super) config: &'a PushConfig,
    pub(super) cond_pushdown: &'a dyn CondPushdown,
    pub(super) tables: Vec<PushedTable>,

    pub(super) join_root: TableNo,
    /// Tables accepted into the pushed join of the current root.
    pub(super) join_scope: TableMap,
    /// Tables before the root. Their values are known when the pushed join is executed.
    pub(super) const_scope: TableMap,
    pub(super) scan_operations: TableMap,
    pub(super) has_pending_cond: TableMap,
    pub(super) skip_reads: TableMap,
    pub(super) internal_op_count: usize,
    pub(super) fld_refs: usize,

    /// Tables of pushed joins created for earlier roots.
    pub(super) pushed_members: TableMap,
    explain: Vec<NoPushReason>,
}

impl<'a> PushedBuilderCtx<'a> {
    pub fn new(
        plan: &'a QueryPlan,
        config: &'a PushConfig,
        cond_pushdown: &'a dyn CondPushdown,
    ) -> Self {
        Self {
            plan,
            config,
            cond_pushdown,
            tables: PushedTable::for_plan(plan),
            join_root: 0,
            join_scope: TableMap::new(),
            const_scope: TableMap::new(),
            scan_operations: TableMap::new(),
            has_pending_cond: TableMap::new(),
            skip_reads: TableMap::new(),
            internal_op_count: 0,
            fld_refs: 0,
            pushed_members: TableMap::new(),
            explain: vec![],
        }
    }

    pub fn prepare(&mut self, root: TableNo) {
        debug!("Preparing pushed join with root '{}'", self.plan.table(root).alias);
        for table in &mut self.tables {
            table.reset();
        }
        self.join_root = root;
        self.join_scope = TableMap::single(root);
        self.const_scope.set_prefix(root);
        self.scan_operations.clear_all();
        if self.plan.table(root).access_type.is_scan() {
            self.scan_operations.add(root);
        }
        self.has_pending_cond.clear_all();
        self.skip_reads.clear_all();
        self.internal_op_count = self.plan.table(root).access_type.internal_op_count();
        self.fld_refs = 0;
    }

    pub fn join_root(&self) -> TableNo {
        self.join_root
    }

    pub fn join_scope(&self) -> TableMap {
        self.join_scope
    }

    pub fn pushed_members(&self) -> TableMap {
        self.pushed_members
    }

    pub fn table(&self, tab_no: TableNo) -> &PushedTable {
        &self.tables[tab_no]
    }

    pub fn explain(&self) -> &[NoPushReason] {
        &self.explain
    }

    pub fn take_explain(&mut self) -> Vec<NoPushReason> {
        std::mem::take(&mut self.explain)
    }

    pub(super) fn alias(&self, tab_no: TableNo) -> &str {
        &self.plan.table(tab_no).alias
    }

    fn add_reason(&mut self, tab_no: TableNo, reason: String) {
        info!("{}", reason);
        self.explain.push(NoPushReason {
            table: tab_no,
            alias: self.alias(tab_no).to_string(),
            reason,
        });
    }

    /// Records why `tab_no` can't be a child of the current root.
    pub(super) fn reject(&mut self, tab_no: TableNo, reason: impl fmt::Display) {
        let reason = format!(
            "Can't push table '{}' as child of '{}', {}",
            self.alias(tab_no),
            self.alias(self.join_root),
            reason
        );
        self.add_reason(tab_no, reason);
    }

    /// Records why `tab_no` can't be pushed at all.
    pub(super) fn reject_table(&mut self, tab_no: TableNo, reason: impl fmt::Display) {
        let reason = format!("Table '{}' is not pushable, {}", self.alias(tab_no), reason);
        self.add_reason(tab_no, reason);
    }

    /// Collects the tables which can be pushed together with the prepared root. False if no
    /// table besides the root qualifies.
    pub fn is_pushable_with_root(&mut self) -> bool {
        let root = self.join_root;
        if self.pushed_members.contain(root) {
            debug!("'{}' is already part of a pushed join", self.alias(root));
            return false;
        }
        if !self.maybe_pushable(root, PUSHABLE_AS_PARENT) {
            return false;
        }
        if self.plan.len() - root < 2 {
            debug!("No tables left to join with root '{}'", self.alias(root));
            return false;
        }
        self.push_root_cond();

        for tab_no in root + 1..self.plan.len() {
            if self.is_pushable_as_child(tab_no) {
                debug!(
                    "Table '{}' pushed as child of '{}'",
                    self.alias(tab_no),
                    self.alias(root)
                );
            }
            for nest in self.plan.nests_ending_at(tab_no) {
                self.validate_join_nest(nest);
            }
        }

        if self.join_scope.len() < 2 {
            debug!("Nothing pushable with root '{}'", self.alias(root));
            return false;
        }
        self.accept_query_plan()
    }

    /// Tries to create a pushed join with `root` as its root table. On success, the tables of
    /// the join can't be part of joins for later roots.
    pub fn make_pushed_join(
        &mut self,
        root: TableNo,
        join_no: usize,
    ) -> Result<Option<Arc<PushedJoin>>> {
        self.prepare(root);
        if !self.is_pushable_with_root() {
            return Ok(None);
        }
        self.optimize_query_plan()?;
        let (query_def, extern_params) = self.build_query()?;
        let join = PushedJoin::new(self.plan, query_def, extern_params, join_no);
        debug!("Created {}", join);
        self.pushed_members.add_map(self.join_scope);
        Ok(Some(Arc::new(join)))
    }
}

impl fmt::Display for NoPushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}
