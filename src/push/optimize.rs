use super::builder::PushedBuilderCtx;
use super::{PushError, Result};
use crate::table_map::{TableMap, TableNo};
use log::debug;

impl PushedBuilderCtx<'_> {
    /// Rejects a scan root returning few rows when the first child scan could be a root with
    /// much more parallelism, and all other children could be pushed below that scan as well.
    pub(super) fn accept_query_plan(&mut self) -> bool {
        let plan = self.plan;
        let root = self.join_root;
        let root_access = plan.table(root);
        if !root_access.access_type.is_scan() {
            return true;
        }
        let children = self.join_scope.difference(TableMap::single(root));
        let scan = match children.intersection(self.scan_operations).first_table(0) {
            Some(scan) => scan,
            None => return true,
        };

        let few_rows = self.config.root_fragments as f64 * self.config.few_rows_ratio;
        let scan_rows = plan.table(scan).rows;
        if root_access.rows >= few_rows
            || scan_rows < root_access.rows * self.config.parallelism_gain
        {
            return true;
        }

        let root_only = TableMap::single(root);
        let movable = children.iter().all(|tab_no| {
            tab_no == scan
                || (tab_no > scan
                    && !self.tables[tab_no]
                        .all_parents()
                        .difference(root_only)
                        .is_clear_all())
        });
        if !movable {
            return true;
        }

        debug!(
            "Root '{}' has {} rows, scan '{}' has {} rows",
            root_access.alias,
            root_access.rows,
            plan.table(scan).alias,
            scan_rows
        );
        self.reject_table(
            root,
            format!(
                "it returns too few rows to be a better root than '{}'",
                plan.table(scan).alias
            ),
        );
        false
    }

    fn is_valid_parent(&self, parent: TableNo, depend: TableMap) -> bool {
        let parent_table = &self.tables[parent];
        let reachable = parent_table
            .ancestor_nests
            .union(parent_table.inner_nest.intersection(self.join_scope));
        depend
            .difference(TableMap::single(parent))
            .difference(reachable)
            .is_clear_all()
    }

    /// Chooses the parent of each pushed table. Parents closer to the root are preferred, as
    /// siblings below the same parent are executed in parallel.
    pub(super) fn optimize_query_plan(&mut self) -> Result<()> {
        let root = self.join_root;
        let scope = self.join_scope;
        let children: Vec<_> = scope.iter().filter(|&tab_no| tab_no != root).collect();

        // Backward pass: a table may pass its mandatory ancestors on to its parent, so parents
        // have to be chosen for the later tables first.
        for &tab_no in children.iter().rev() {
            let table = &self.tables[tab_no];
            let mut common_parents = scope;
            let mut extend_parents = TableMap::new();
            for parents in table.key_parents.iter().filter(|parents| !parents.is_clear_all()) {
                common_parents.intersect(*parents);
                extend_parents.add_map(*parents);
            }
            let depend = table.ancestors;
            let floor = depend.last_table(tab_no - 1).ok_or_else(|| {
                PushError::Internal(format!(
                    "pushed table '{}' has no ancestors",
                    self.alias(tab_no)
                ))
            })?;

            let parent = [
                common_parents.first_table(floor),
                extend_parents.first_table(floor),
            ]
            .into_iter()
            .flatten()
            .find(|&candidate| candidate < tab_no && self.is_valid_parent(candidate, depend))
            .unwrap_or(floor);

            debug!(
                "Parent of '{}' is '{}', common {}, extend {}, depend {}",
                self.alias(tab_no),
                self.alias(parent),
                common_parents,
                extend_parents,
                depend
            );
            self.tables[tab_no].parent = Some(parent);
            let inherited = depend.difference(TableMap::single(parent));
            self.tables[parent].ancestors.add_map(inherited);
        }

        // Forward pass: the full ancestor chain of each table.
        self.tables[root].ancestors.clear_all();
        for &tab_no in &children {
            let parent = self.tables[tab_no].parent.ok_or_else(|| {
                PushError::Internal(format!("pushed table '{}' has no parent", self.alias(tab_no)))
            })?;
            let ancestors = self.tables[parent].ancestors.union(TableMap::single(parent));
            self.tables[tab_no].ancestors = ancestors;
        }
        Ok(())
    }
}
