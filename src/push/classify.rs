use super::builder::PushedBuilderCtx;
use super::table::{PUSHABILITY_KNOWN, PUSHABLE_AS_CHILD, PUSHABLE_AS_PARENT};
use crate::access::{AccessType, StorageEngine, TableAccess};
use crate::cond::CondSplit;
use crate::expr::{Expr, FieldRef};
use crate::table_map::{TableMap, TableNo};
use itertools::Itertools;
use log::debug;

/// Pushability of a table regardless of the root it's pushed with.
fn table_pushability(access: &TableAccess) -> Result<u8, String> {
    match access.access_type {
        AccessType::Fixed | AccessType::Undecided | AccessType::Other => {
            return Err(format!("access type '{}' is not pushable", access.access_type));
        }
        _ => {}
    }
    if access.table.engine != StorageEngine::Ndb {
        Err(format!("table is stored in the {} engine", access.table.engine))
    } else if access.table.user_partitioned {
        Err("table has user defined partitioning".to_string())
    } else if access.reads_blobs {
        Err("select list can't contain BLOB columns".to_string())
    } else if access.for_update {
        Err("lock modes other than 'read committed' are not supported".to_string())
    } else {
        Ok(PUSHABLE_AS_PARENT | PUSHABLE_AS_CHILD)
    }
}

impl PushedBuilderCtx<'_> {
    /// Whether `tab_no` may be pushed in any of the roles in `check`. The verdict is computed
    /// once per plan.
    pub(super) fn maybe_pushable(&mut self, tab_no: TableNo, check: u8) -> bool {
        if self.tables[tab_no].properties & PUSHABILITY_KNOWN == 0 {
            let properties = match table_pushability(self.plan.table(tab_no)) {
                Ok(properties) => properties,
                Err(reason) => {
                    self.reject_table(tab_no, reason);
                    0
                }
            };
            self.tables[tab_no].properties = properties | PUSHABILITY_KNOWN;
        }
        self.tables[tab_no].properties & check == check
    }

    fn push_cond(&self, tab_no: TableNo, allowed: TableMap) -> CondSplit {
        match &self.plan.table(tab_no).condition {
            Some(cond) => self.cond_pushdown.push_cond(cond, tab_no, allowed),
            None => Default::default(),
        }
    }

    /// The root's condition can only refer to tables before the root, and only when the root
    /// is read by a scan.
    pub(super) fn push_root_cond(&mut self) {
        let root = self.join_root;
        let allowed = if self.plan.table(root).access_type.is_lookup() {
            TableMap::new()
        } else {
            self.const_scope
        };
        let split = self.push_cond(root, allowed);
        let refs = referred_fields(split.pushed.as_ref(), root).len();
        let table = &mut self.tables[root];
        if refs > self.config.max_referred_fields {
            table.pending_cond = self.plan.table(root).condition.clone();
        } else {
            self.fld_refs += refs;
            table.pushed_cond = split.pushed;
            table.pending_cond = split.remainder;
        }
        if table.pending_cond.is_some() {
            self.has_pending_cond.add(root);
        }
    }

    /// Checks whether `tab_no` can become a child in the pushed join of the current root. On
    /// success the table is added to the join scope.
    pub(super) fn is_pushable_as_child(&mut self, tab_no: TableNo) -> bool {
        let plan = self.plan;
        let root = self.join_root;
        let access = plan.table(tab_no);

        if self.pushed_members.contain(tab_no) {
            self.reject(tab_no, "table is already part of another pushed join");
            return false;
        }
        if !self.maybe_pushable(tab_no, PUSHABLE_AS_CHILD) {
            return false;
        }
        if let AccessType::MultiRangeUniqueKey | AccessType::MultiRangeMixed = access.access_type {
            self.reject(
                tab_no,
                format!("'{}' access is not pushable as child", access.access_type),
            );
            return false;
        }
        if access.key_fields.len() > self.config.max_key_parts {
            self.reject(
                tab_no,
                format!("table has more than {} key parts", self.config.max_key_parts),
            );
            return false;
        }
        if access.use_order {
            self.reject(tab_no, "rows have to be read in index order");
            return false;
        }
        if access.select_no != plan.table(root).select_no {
            self.reject(tab_no, "table is in another query block than the root");
            return false;
        }
        let op_cost = access.access_type.internal_op_count();
        if self.internal_op_count + op_cost > self.config.max_operations {
            self.reject(
                tab_no,
                format!(
                    "the pushed join would exceed {} operations",
                    self.config.max_operations
                ),
            );
            return false;
        }

        let table = &self.tables[tab_no];
        let (is_scan, sj_nest, embedding) =
            (table.is_scan(), table.sj_nest, table.embedding_nests());
        let nest_firsts = [
            Some(table.first_inner),
            table.first_sj_inner,
            table.first_anti_inner,
        ];
        let skip_read = table.first_sj_inner.map_or(false, |first| first > root);

        let mut key_parents = Vec::with_capacity(access.key_fields.len());
        let mut fld_refs = 0;
        for (key_part_no, key) in access.key_fields.iter().enumerate() {
            let column = match access.key_column(key_part_no) {
                Some(column) => column,
                None => {
                    self.reject(tab_no, format!("key part {} has no index column", key_part_no));
                    return false;
                }
            };
            match key {
                Expr::Field(field) => {
                    let field_type = plan
                        .table(field.table)
                        .table
                        .columns
                        .get(field.column)
                        .map(|col| col.data_type);
                    if field.table >= tab_no || field_type != Some(column.data_type) {
                        self.reject(
                            tab_no,
                            format!(
                                "column '{}' can't be used as key for '{}'",
                                field, column.name
                            ),
                        );
                        return false;
                    }
                    let parents = self.key_parent_candidates(field, embedding);
                    if parents.is_clear_all() {
                        if !self.const_scope.contain(field.table) {
                            self.reject(
                                tab_no,
                                format!(
                                    "key part {} refers table '{}' which was not pushed",
                                    key_part_no,
                                    self.alias(field.table)
                                ),
                            );
                            return false;
                        }
                        fld_refs += 1;
                    }
                    key_parents.push(parents);
                }
                Expr::Param(_) => key_parents.push(TableMap::new()),
                _ => match key.const_value() {
                    Some(val) if val.is_null() => {
                        self.reject(tab_no, format!("key part {} is NULL", key_part_no));
                        return false;
                    }
                    Some(val) if column.data_type.accepts(&val) => {
                        key_parents.push(TableMap::new())
                    }
                    Some(val) => {
                        self.reject(
                            tab_no,
                            format!(
                                "constant {} does not match the type of '{}'",
                                val, column.name
                            ),
                        );
                        return false;
                    }
                    None => {
                        self.reject(
                            tab_no,
                            format!(
                                "key part {} ({}) can't be evaluated before the join",
                                key_part_no, key
                            ),
                        );
                        return false;
                    }
                },
            }
        }

        let all_parents = key_parents
            .iter()
            .fold(TableMap::new(), |acc, parents| acc.union(*parents));
        if all_parents.is_clear_all() {
            self.reject(tab_no, "no parent found");
            return false;
        }
        let mut depend_parents: TableMap = key_parents
            .iter()
            .filter_map(|parents| parents.first_table(0))
            .collect();

        let mut allowed = self.join_scope.intersection(embedding);
        if !plan.table(root).access_type.is_lookup() {
            allowed.add_map(self.const_scope);
        }
        let split = self.push_cond(tab_no, allowed);
        let cond_refs = referred_fields(split.pushed.as_ref(), tab_no);
        let linked_count = cond_refs
            .iter()
            .filter(|field| self.join_scope.contain(field.table))
            .count();
        if linked_count > self.config.max_linked_cond_params {
            self.reject(
                tab_no,
                format!(
                    "condition refers more than {} fields of other tables",
                    self.config.max_linked_cond_params
                ),
            );
            return false;
        }
        fld_refs += cond_refs.len() - linked_count;
        if self.fld_refs + fld_refs > self.config.max_referred_fields {
            self.reject(
                tab_no,
                format!(
                    "the pushed join would refer more than {} fields of preceding tables",
                    self.config.max_referred_fields
                ),
            );
            return false;
        }
        if split.remainder.is_some() {
            self.has_pending_cond.add(tab_no);
        }
        let cond_parents = split
            .pushed
            .as_ref()
            .map_or(TableMap::new(), |cond| cond.tables())
            .intersection(self.join_scope);
        depend_parents.add_map(cond_parents);

        if is_scan {
            // Covers parents of the condition as well as of the key. Rows of a scan may be
            // returned again with each batch of the child scan, which defeats skipping of
            // duplicate semi join matches.
            let skipped = depend_parents
                .intersection(self.skip_reads)
                .intersection(self.scan_operations)
                .difference(sj_nest);
            if !skipped.is_clear_all() {
                self.reject(
                    tab_no,
                    format!(
                        "scan depends on semi joined scan '{}'",
                        self.alias(skipped.first_table(0).unwrap_or(root))
                    ),
                );
                return false;
            }
            if !self.is_pushable_as_child_scan(tab_no, depend_parents) {
                return false;
            }
        }

        let mut nest_parents = TableMap::new();
        for first in nest_firsts
            .into_iter()
            .flatten()
            .filter(|&first| root < first && first < tab_no)
        {
            if !self.join_scope.contain(first) {
                self.reject(
                    tab_no,
                    format!("first table '{}' of its join nest is not pushed", self.alias(first)),
                );
                return false;
            }
            nest_parents.add(first);
        }
        depend_parents.add_map(nest_parents);

        let ancestor_nests = match self.set_ancestor_nests(tab_no, depend_parents) {
            Some(ancestor_nests) => ancestor_nests,
            None => return false,
        };

        let table = &mut self.tables[tab_no];
        table.key_parents = key_parents;
        table.nest_parents = nest_parents;
        table.cond_parents = cond_parents;
        table.ancestors = depend_parents;
        table.ancestor_nests = ancestor_nests;
        table.pushed_cond = split.pushed;
        table.pending_cond = split.remainder;

        self.join_scope.add(tab_no);
        if is_scan {
            self.scan_operations.add(tab_no);
        }
        if skip_read {
            self.skip_reads.add(tab_no);
        }
        self.internal_op_count += op_cost;
        self.fld_refs += fld_refs;
        true
    }

    /// Pushed tables which could supply the value of `field`: the field's own table and, through
    /// the equality classes, tables having a row exactly when the field's table has one. A
    /// table of an upper nest qualifies too if the field's table embeds the child, as the child
    /// is then NULL extended along with the field's table.
    fn key_parent_candidates(&self, field: &FieldRef, embedding: TableMap) -> TableMap {
        let source = &self.tables[field.table];
        let upper = if embedding.contain(field.table) {
            source.upper_nests
        } else {
            TableMap::new()
        };
        std::iter::once(field.table)
            .chain(
                self.plan
                    .equalities()
                    .equivalents(field)
                    .map(|equal| equal.table),
            )
            .filter(|&other| {
                self.join_scope.contain(other)
                    && (self.tables[other].first_inner == source.first_inner
                        || upper.contain(other))
            })
            .collect()
    }

    /// Scans which are outer or semi joined with the root. A row of an ancestor scan may be
    /// delivered with several batches of the child's rows, so the SQL layer must be able to
    /// tell all matches of the row from the child's rows alone.
    pub(super) fn is_pushable_as_child_scan(&mut self, tab_no: TableNo, depend: TableMap) -> bool {
        let root = self.join_root;
        let table = &self.tables[tab_no];
        let (first_inner, first_sj_inner) = (table.first_inner, table.first_sj_inner);

        if first_inner > root {
            if self.has_pending_cond.contain(tab_no) {
                self.reject(tab_no, "outer joined scan has a condition which is not pushed");
                return false;
            }
            if !self.is_pushable_within_nest(tab_no, first_inner, depend, false) {
                return false;
            }
        }

        if let Some(first_sj) = first_sj_inner.filter(|&first| first > root) {
            if !self.config.outer_joined_scans {
                self.reject(tab_no, "storage nodes do not support semi joined scans");
                return false;
            }
            if self.has_pending_cond.contain(tab_no) {
                self.reject(tab_no, "semi joined scan has a condition which is not pushed");
                return false;
            }
            if !self.is_pushable_within_nest(tab_no, first_sj, depend, true) {
                return false;
            }
        }
        true
    }

    /// Checks the tables preceding `tab_no` in the nest starting at `first`. When `depend`
    /// refers tables outside that nest, the embedding nest is checked as well.
    pub(super) fn is_pushable_within_nest(
        &mut self,
        tab_no: TableNo,
        first: TableNo,
        depend: TableMap,
        semi: bool,
    ) -> bool {
        let root = self.join_root;
        let kind = if semi { "semi" } else { "outer" };
        let mut first = first;
        loop {
            let nest = TableMap::range(first, tab_no.saturating_sub(1));
            if nest.is_overlapping(self.has_pending_cond) {
                self.reject(
                    tab_no,
                    format!("{} joined nest of scan has conditions which are not pushed", kind),
                );
                return false;
            }
            if !self.join_scope.contain_map(nest) {
                self.reject(
                    tab_no,
                    format!("not all tables in the {} joined nest of the scan are pushed", kind),
                );
                return false;
            }
            if self.plan.table(first).nest_condition.is_some() {
                self.reject(
                    tab_no,
                    format!(
                        "{} joined nest starting at '{}' has a filter",
                        kind,
                        self.alias(first)
                    ),
                );
                return false;
            }

            let upper = if semi {
                self.tables[first].first_sj_upper
            } else {
                self.tables[first].first_upper
            };
            match upper {
                Some(upper)
                    if upper > root && depend.first_table(0).map_or(false, |t| t < first) =>
                {
                    debug!(
                        "Scan '{}' refers tables outside its nest, checking nest at '{}'",
                        self.alias(tab_no),
                        self.alias(upper)
                    );
                    first = upper;
                }
                _ => return true,
            }
        }
    }

    /// Validates that the tables `depend` a child depends on can all be ancestors of the child.
    /// Returns the tables the child may have as ancestors.
    pub(super) fn set_ancestor_nests(
        &mut self,
        tab_no: TableNo,
        depend: TableMap,
    ) -> Option<TableMap> {
        let parent_no = match depend.last_table(tab_no.saturating_sub(1)) {
            Some(parent_no) => parent_no,
            None => {
                self.reject(tab_no, "no parent found");
                return None;
            }
        };
        let parent = &self.tables[parent_no];
        let allowed = parent
            .ancestor_nests
            .union(TableMap::single(parent_no))
            .union(parent.inner_nest.intersection(self.join_scope));
        // A parent outside the child's embedding nests is fine when the child's own nest starts
        // below it, as in a chain of LEFT JOINs. The child then inherits the nests of its
        // parent besides the nests embedding its own.
        let table = &self.tables[tab_no];
        let outer_joined_parent =
            !table.embedding_nests().contain(parent_no) && table.first_inner <= parent_no;
        let nest = if table.is_inner_joined_to(parent_no) {
            table.inner_nest
        } else {
            table.upper_nests.union(parent.upper_nests)
        };

        if !allowed.contain_map(depend) {
            let outside = depend.difference(allowed);
            self.reject(
                tab_no,
                format!(
                    "dependency on '{}' is not in a nest embedding '{}'",
                    self.alias(outside.first_table(0).unwrap_or(parent_no)),
                    self.alias(parent_no)
                ),
            );
            return None;
        }
        if outer_joined_parent {
            self.reject(
                tab_no,
                format!(
                    "it would be inner joined with the outer joined parent '{}'",
                    self.alias(parent_no)
                ),
            );
            return None;
        }

        Some(allowed.union(nest.intersection(self.join_scope)))
    }
}

/// Distinct fields of other tables than `tab_no` referred by `cond`.
fn referred_fields(cond: Option<&Expr>, tab_no: TableNo) -> Vec<FieldRef> {
    cond.map_or(vec![], |cond| {
        cond.fields()
            .filter(|field| field.table != tab_no)
            .unique()
            .cloned()
            .collect()
    })
}
