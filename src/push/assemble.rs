use super::builder::PushedBuilderCtx;
use super::{PushError, Result};
use crate::access::{AccessType, IndexUse};
use crate::expr::{Expr, FieldRef, Value};
use crate::pushed_join::ExternParam;
use crate::query_def::{MatchType, Operand, OperationOptions, QueryBuilder, QueryDef};
use crate::table_map::TableNo;
use log::debug;

/// Where the value of a key part or filter operand comes from.
#[derive(Debug, Clone, PartialEq)]
enum KeyRef {
    Const(Value),
    /// Statement parameter.
    Param(usize),
    /// Field of a pushed ancestor.
    Linked(FieldRef),
    /// Field of a table preceding the root. Supplied with each execution of the join.
    Extern(FieldRef),
}

/// Parameters of the pushed join beyond the root's key values.
struct ExternParams {
    key_count: usize,
    params: Vec<ExternParam>,
}

impl ExternParams {
    fn operand(&mut self, param: ExternParam) -> Operand {
        let pos = match self.params.iter().position(|known| *known == param) {
            Some(pos) => pos,
            None => {
                self.params.push(param);
                self.params.len() - 1
            }
        };
        Operand::Param(self.key_count + pos)
    }
}

/// Fields of other tables and parameters of `cond`, in order of first appearance.
fn filter_refs(cond: &Expr, tab_no: TableNo) -> Vec<KeyRef> {
    let mut refs = vec![];
    for expr in cond.iter_tree() {
        let key_ref = match expr {
            Expr::Field(field) if field.table != tab_no => KeyRef::Linked(field.clone()),
            Expr::Param(num) => KeyRef::Param(*num),
            _ => continue,
        };
        if !refs.contains(&key_ref) {
            refs.push(key_ref);
        }
    }
    refs
}

impl PushedBuilderCtx<'_> {
    /// Column of `table` known to be equal to `field`, `field` itself if it belongs to `table`.
    fn equivalent_field(&self, field: &FieldRef, table: TableNo) -> Option<FieldRef> {
        self.plan
            .equalities()
            .equivalents(field)
            .find(|equal| equal.table == table)
            .cloned()
    }

    /// Resolves the key parts of a pushed child. A field is preferably taken from the chosen
    /// parent, otherwise from the closest ancestor supplying it.
    pub(super) fn collect_key_refs(&self, tab_no: TableNo) -> Result<Vec<KeyRef>> {
        let access = self.plan.table(tab_no);
        let table = &self.tables[tab_no];
        let parent = table.parent.ok_or_else(|| {
            PushError::Internal(format!("pushed table '{}' has no parent", access.alias))
        })?;

        let mut refs = Vec::with_capacity(access.key_fields.len());
        for (key, parents) in access.key_fields.iter().zip(&table.key_parents) {
            let key_ref = match key {
                Expr::Field(field) if parents.is_clear_all() => KeyRef::Extern(field.clone()),
                Expr::Field(field) => {
                    let source = if parents.contain(parent) {
                        Some(parent)
                    } else {
                        parents.intersection(table.ancestors).last_table(tab_no - 1)
                    };
                    let linked = source.and_then(|source| self.equivalent_field(field, source));
                    KeyRef::Linked(linked.ok_or_else(|| {
                        PushError::Internal(format!(
                            "no ancestor of '{}' supplies key field {}",
                            access.alias, field
                        ))
                    })?)
                }
                Expr::Param(num) => KeyRef::Param(*num),
                _ => KeyRef::Const(key.const_value().ok_or_else(|| {
                    PushError::Internal(format!(
                        "key {} of '{}' is not constant",
                        key, access.alias
                    ))
                })?),
            };
            refs.push(key_ref);
        }
        Ok(refs)
    }

    fn build_key(
        &self,
        builder: &QueryBuilder,
        externs: &mut ExternParams,
        key_ref: KeyRef,
    ) -> Result<Operand> {
        match key_ref {
            KeyRef::Const(val) => Ok(builder.const_value(val)?),
            KeyRef::Param(num) => Ok(externs.operand(ExternParam::Statement(num))),
            KeyRef::Extern(field) => Ok(externs.operand(ExternParam::Field(field))),
            KeyRef::Linked(field) if self.const_scope.contain(field.table) => {
                Ok(externs.operand(ExternParam::Field(field)))
            }
            KeyRef::Linked(field) => {
                let op = self.tables[field.table].op.ok_or_else(|| {
                    PushError::Internal(format!("field {} refers a table without operation", field))
                })?;
                Ok(builder.linked_value(op, field)?)
            }
        }
    }

    fn match_type(&self, tab_no: TableNo, parent: TableNo) -> MatchType {
        let table = &self.tables[tab_no];
        let below_parent = |first: Option<TableNo>| first.map_or(false, |first| first > parent);
        if below_parent(table.first_anti_inner) {
            MatchType::NullOnly
        } else if below_parent(table.first_sj_inner) {
            MatchType::FirstMatch
        } else if table.first_inner > parent {
            MatchType::Outer
        } else {
            MatchType::InnerJoin
        }
    }

    /// Builds the operation tree of the join scope. Returns it with the parameters the join needs
    /// besides the root's key values.
    pub(super) fn build_query(&mut self) -> Result<(QueryDef, Vec<ExternParam>)> {
        let plan = self.plan;
        let root = self.join_root;
        let mut builder = QueryBuilder::new();
        let mut externs = ExternParams {
            key_count: plan.table(root).key_fields.len(),
            params: vec![],
        };

        for tab_no in self.join_scope.iter() {
            let access = plan.table(tab_no);
            let keys = if tab_no == root {
                (0..access.key_fields.len())
                    .map(|num| builder.param_value(num))
                    .collect()
            } else {
                let mut keys = vec![];
                for key_ref in self.collect_key_refs(tab_no)? {
                    keys.push(self.build_key(&builder, &mut externs, key_ref)?);
                }
                keys
            };

            let mut options = OperationOptions::default();
            if let Some(cond) = &self.tables[tab_no].pushed_cond {
                for key_ref in filter_refs(cond, tab_no) {
                    let operand = self.build_key(&builder, &mut externs, key_ref)?;
                    options.filter_operands.push(operand);
                }
                options.filter = Some(cond.clone());
            }

            if tab_no != root {
                let parent = self.tables[tab_no].parent.ok_or_else(|| {
                    PushError::Internal(format!("pushed table '{}' has no parent", access.alias))
                })?;
                let parent_op = self.tables[parent].op.ok_or_else(|| {
                    PushError::Internal(format!(
                        "parent '{}' has no operation",
                        self.alias(parent)
                    ))
                })?;
                if QueryBuilder::implicit_parent(&keys, &options.filter_operands) != Some(parent_op)
                {
                    options.parent = Some(parent_op);
                }
                options.match_type = self.match_type(tab_no, parent);
            }

            let index = access.index.unwrap_or(IndexUse::Primary);
            let op = match access.access_type {
                AccessType::PrimaryKey => builder.read_tuple(tab_no, access, keys, options)?,
                AccessType::UniqueKey => {
                    builder.unique_index_read(tab_no, access, index, keys, options)?
                }
                AccessType::OrderedIndexScan
                | AccessType::MultiRangePrimaryKey
                | AccessType::MultiRangeUniqueKey
                | AccessType::MultiRangeMixed => {
                    builder.scan_index(tab_no, access, index, keys, options)?
                }
                AccessType::TableScan => builder.scan_table(tab_no, access, options)?,
                AccessType::Fixed | AccessType::Undecided | AccessType::Other => {
                    return Err(PushError::Internal(format!(
                        "unexpected access type '{}' of pushed table '{}'",
                        access.access_type, access.alias
                    )));
                }
            };
            debug!("Table '{}' is operation #{}", access.alias, op);
            self.tables[tab_no].op = Some(op);
        }

        Ok((builder.prepare()?, externs.params))
    }
}
