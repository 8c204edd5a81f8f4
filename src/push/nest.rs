use super::builder::PushedBuilderCtx;
use crate::access::JoinNest;
use crate::table_map::{TableMap, TableNo};
use log::debug;

impl PushedBuilderCtx<'_> {
    /// Called when the walk has passed the last table of `nest`. Scans in an outer or semi
    /// joined nest can only stay pushed when the whole nest is pushed without leftover
    /// conditions, otherwise their rows could be NULL extended or skipped too early.
    pub(super) fn validate_join_nest(&mut self, nest: JoinNest) {
        if nest.first <= self.join_root {
            return;
        }
        let range = TableMap::range(nest.first, nest.last);
        let pushed_scans = range
            .intersection(self.scan_operations)
            .intersection(self.join_scope);
        if pushed_scans.is_clear_all() {
            return;
        }

        let reason = if !self.join_scope.contain_map(range) {
            format!("not all tables in its {} joined nest were pushed", nest.kind)
        } else if range.is_overlapping(self.has_pending_cond) {
            format!(
                "tables in its {} joined nest have conditions which are not pushed",
                nest.kind
            )
        } else if self.plan.table(nest.first).nest_condition.is_some() {
            format!("its {} joined nest has a filter", nest.kind)
        } else {
            return;
        };

        debug!(
            "Removing scans {} of {} nest starting at '{}'",
            pushed_scans,
            nest.kind,
            self.alias(nest.first)
        );
        for tab_no in pushed_scans.iter() {
            // Earlier removals may have cascaded to this scan.
            if self.join_scope.contain(tab_no) {
                self.reject(tab_no, &reason);
                self.remove_pushable(tab_no);
            }
        }
    }

    /// Removes `tab_no` from the join scope together with every later table depending on it.
    /// Tables only depend on earlier tables, so one forward sweep reaches all of them.
    pub(super) fn remove_pushable(&mut self, tab_no: TableNo) {
        let mut removed = TableMap::single(tab_no);
        self.unpush(tab_no);

        for later in tab_no + 1..self.plan.len() {
            if !self.join_scope.contain(later) {
                continue;
            }
            let table = &self.tables[later];
            let lost_key = table.key_parents.iter().find_map(|parents| {
                (!parents.is_clear_all() && !parents.is_overlapping(self.join_scope))
                    .then(|| parents.first_table(0))
                    .flatten()
            });
            let lost_parent = table
                .nest_parents
                .union(table.cond_parents)
                .intersection(removed)
                .first_table(0);

            match lost_key.or(lost_parent) {
                Some(lost) => {
                    self.reject(
                        later,
                        format!(
                            "it depends on '{}' which was removed from the pushed join",
                            self.alias(lost)
                        ),
                    );
                    removed.add(later);
                    self.unpush(later);
                }
                None => {
                    let scope = self.join_scope;
                    let table = &mut self.tables[later];
                    for parents in &mut table.key_parents {
                        parents.intersect(scope);
                    }
                    table.ancestor_nests.intersect(scope);
                    table.ancestors = table.mandatory_parents();
                }
            }
        }
    }

    fn unpush(&mut self, tab_no: TableNo) {
        self.join_scope.clear_bit(tab_no);
        self.scan_operations.clear_bit(tab_no);
        self.skip_reads.clear_bit(tab_no);
        self.internal_op_count = self
            .internal_op_count
            .saturating_sub(self.tables[tab_no].access_type.internal_op_count());
    }
}
