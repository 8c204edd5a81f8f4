use crate::access::{AccessType, IndexUse, QueryPlan};
use crate::expr::{FieldRef, Value};
use crate::query_def::{InstanceError, OpId, QueryDef, QueryInstance};
use crate::table_map::TableNo;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;

/// A parameter of a pushed join which is not a key value of the root.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternParam {
    /// Field of a table joined before the root of the pushed join.
    Field(FieldRef),
    /// Parameter of the statement.
    Statement(usize),
}

/// Current values of the fields of tables preceding a pushed join.
pub trait FieldValues {
    fn value(&self, field: &FieldRef) -> Option<Value>;
}

impl<S: BuildHasher> FieldValues for HashMap<FieldRef, Value, S> {
    fn value(&self, field: &FieldRef) -> Option<Value> {
        self.get(field).cloned()
    }
}

/// A join which is executed as one composite query by the storage nodes. Immutable once
/// created, shared by the handlers of all tables in the join.
#[derive(Debug)]
pub struct PushedJoin {
    query_def: Arc<QueryDef>,
    /// Plan table of each operation.
    tables: Vec<TableNo>,
    root_access_type: AccessType,
    root_index: Option<IndexUse>,
    key_param_count: usize,
    extern_params: Vec<ExternParam>,
    join_no: usize,
}

impl PushedJoin {
    pub fn new(
        plan: &QueryPlan,
        query_def: QueryDef,
        extern_params: Vec<ExternParam>,
        join_no: usize,
    ) -> Self {
        let root = plan.table(query_def.root().table_no);
        Self {
            tables: query_def.operations().iter().map(|op| op.table_no).collect(),
            root_access_type: root.access_type,
            root_index: root.index,
            key_param_count: root.key_fields.len(),
            query_def: Arc::new(query_def),
            extern_params,
            join_no,
        }
    }

    pub fn operation_count(&self) -> usize {
        self.tables.len()
    }

    /// Plan table of operation `op`.
    pub fn table(&self, op: OpId) -> Option<TableNo> {
        self.tables.get(op).copied()
    }

    pub fn tables(&self) -> &[TableNo] {
        &self.tables
    }

    pub fn join_no(&self) -> usize {
        self.join_no
    }

    pub fn query_def(&self) -> &QueryDef {
        &self.query_def
    }

    pub fn extern_params(&self) -> &[ExternParam] {
        &self.extern_params
    }

    /// Number of fields from tables outside the join which are parameters of the join.
    pub fn field_ref_count(&self) -> usize {
        self.extern_params
            .iter()
            .filter(|param| matches!(param, ExternParam::Field(_)))
            .count()
    }

    pub fn has_scan_children(&self) -> bool {
        self.query_def.has_scan_children()
    }

    fn extern_fields(&self) -> impl Iterator<Item = &FieldRef> {
        self.extern_params.iter().filter_map(|param| match param {
            ExternParam::Field(field) => Some(field),
            ExternParam::Statement(_) => None,
        })
    }

    /// Checks whether the join can still be executed for the current row of the preceding
    /// tables. A NULL field can't match any key, the join has to be executed unpushed then.
    pub fn match_definition(
        &self,
        access_type: AccessType,
        index: Option<IndexUse>,
        fields: &dyn FieldValues,
    ) -> bool {
        if access_type != self.root_access_type || index != self.root_index {
            debug!(
                "Root of pushed join@{} is now read by {}, was {}",
                self.join_no, access_type, self.root_access_type
            );
            return false;
        }
        for field in self.extern_fields() {
            if fields.value(field).map_or(true, |val| val.is_null()) {
                debug!(
                    "Field {} is NULL, can't execute pushed join@{}",
                    field, self.join_no
                );
                return false;
            }
        }
        true
    }

    /// Binds the parameters of one execution: the root's key values followed by the extern
    /// parameters.
    pub fn make_query_instance(
        &self,
        key_params: &[Value],
        stmt_params: &[Value],
        fields: &dyn FieldValues,
    ) -> Result<QueryInstance, InstanceError> {
        if key_params.len() != self.key_param_count {
            return Err(InstanceError::ParamCount {
                expected: self.key_param_count,
                actual: key_params.len(),
            });
        }
        let mut params = Vec::with_capacity(self.key_param_count + self.extern_params.len());
        params.extend_from_slice(key_params);
        for param in &self.extern_params {
            let val = match param {
                ExternParam::Statement(num) => stmt_params
                    .get(*num)
                    .cloned()
                    .ok_or(InstanceError::MissingParam(*num))?,
                ExternParam::Field(field) => match fields.value(field) {
                    Some(Value::Null) => {
                        return Err(InstanceError::NullField(field.name().to_string()))
                    }
                    Some(val) => val,
                    None => return Err(InstanceError::MissingField(field.name().to_string())),
                },
            };
            params.push(val);
        }
        QueryInstance::new(self.query_def.clone(), params)
    }

    /// EXPLAIN text of operation `op`.
    pub fn explain(&self, op: OpId) -> Option<String> {
        let def = self.query_def.operation(op)?;
        match def.parent {
            None => Some(format!(
                "Parent of {} pushed join@{}",
                self.operation_count(),
                self.join_no
            )),
            Some(parent) => {
                let parent = self.query_def.operation(parent)?;
                Some(format!(
                    "Child of '{}' in pushed join@{}",
                    parent.alias, self.join_no
                ))
            }
        }
    }
}

impl From<&PushedJoin> for termtree::Tree<String> {
    fn from(join: &PushedJoin) -> Self {
        let mut tree = Self::new(format!(
            "pushed join@{} ({} operations)",
            join.join_no,
            join.operation_count()
        ));
        tree.push(Self::from(join.query_def.as_ref()));
        if !join.extern_params.is_empty() {
            tree.push(
                Self::new("params".to_string()).with_leaves(
                    join.extern_params
                        .iter()
                        .enumerate()
                        .map(|(num, param)| format!("?{} = {}", join.key_param_count + num, param)),
                ),
            );
        }
        tree
    }
}

impl fmt::Display for PushedJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", termtree::Tree::<String>::from(self))
    }
}

impl fmt::Display for ExternParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternParam::Field(field) => write!(f, "{}", field),
            ExternParam::Statement(num) => write!(f, "statement param {}", num),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cond::InterpretedCondPushdown;
    use crate::engine::PushConfig;
    use crate::push::PushedBuilderCtx;
    use crate::test_utils;
    use pretty_assertions::assert_eq;
    use rustc_hash::FxHashMap;
    use std::thread;

    fn t0_a() -> FieldRef {
        FieldRef::new(0, 1, "t0.a")
    }

    fn make_join() -> Arc<PushedJoin> {
        let plan = test_utils::extern_field_join();
        let config = PushConfig::default();
        let cond = InterpretedCondPushdown;
        let mut ctx = PushedBuilderCtx::new(&plan, &config, &cond);
        assert!(ctx.make_pushed_join(0, 0).unwrap().is_none());
        ctx.make_pushed_join(1, 0).unwrap().unwrap()
    }

    #[test]
    fn parameters_of_join() {
        let join = make_join();
        assert_eq!(join.tables(), &[1, 2]);
        assert_eq!(join.table(1), Some(2));
        assert_eq!(join.table(2), None);
        assert_eq!(join.field_ref_count(), 1);
        assert_eq!(
            join.extern_params(),
            &[ExternParam::Field(t0_a()), ExternParam::Statement(1)]
        );

        let text = join.to_string();
        assert!(text.starts_with("pushed join@0 (2 operations)"));
        assert!(text.contains("?1 = t0.a"));
        assert!(text.contains("?2 = statement param 1"));
    }

    #[test]
    fn match_definition_rejects_null_fields() {
        let join = make_join();
        let mut fields = FxHashMap::default();
        fields.insert(t0_a(), Value::Long(3));
        let index = Some(IndexUse::Index(0));
        assert!(join.match_definition(AccessType::OrderedIndexScan, index, &fields));
        assert!(!join.match_definition(AccessType::TableScan, None, &fields));
        assert!(!join.match_definition(
            AccessType::OrderedIndexScan,
            Some(IndexUse::Primary),
            &fields
        ));

        fields.insert(t0_a(), Value::Null);
        assert!(!join.match_definition(AccessType::OrderedIndexScan, index, &fields));
        fields.clear();
        assert!(!join.match_definition(AccessType::OrderedIndexScan, index, &fields));
    }

    #[test]
    fn query_instance_params() {
        let join = make_join();
        let mut fields = FxHashMap::default();
        fields.insert(t0_a(), Value::Long(3));
        let stmt_params = [Value::Long(5), Value::Long(9)];

        let instance = join
            .make_query_instance(&[Value::Long(5)], &stmt_params, &fields)
            .unwrap();
        assert_eq!(
            instance.params(),
            &[Value::Long(5), Value::Long(3), Value::Long(9)]
        );
        assert_eq!(
            join.make_query_instance(&[], &stmt_params, &fields).unwrap_err(),
            InstanceError::ParamCount {
                expected: 1,
                actual: 0
            }
        );
        assert_eq!(
            join.make_query_instance(&[Value::Long(5)], &stmt_params[..1], &fields)
                .unwrap_err(),
            InstanceError::MissingParam(1)
        );
        fields.insert(t0_a(), Value::Null);
        assert_eq!(
            join.make_query_instance(&[Value::Long(5)], &stmt_params, &fields)
                .unwrap_err(),
            InstanceError::NullField("t0.a".to_string())
        );
    }

    #[test]
    fn explain_operations() {
        let join = make_join();
        assert_eq!(join.explain(0).unwrap(), "Parent of 2 pushed join@0");
        assert_eq!(join.explain(1).unwrap(), "Child of 't1' in pushed join@0");
        assert_eq!(join.explain(2), None);
    }

    #[test]
    fn instances_from_many_threads() {
        let join = make_join();
        let handles: Vec<_> = (0..4)
            .map(|num| {
                let join = join.clone();
                thread::spawn(move || {
                    let mut fields = FxHashMap::default();
                    fields.insert(t0_a(), Value::Long(num));
                    let instance = join
                        .make_query_instance(
                            &[Value::Long(num)],
                            &[Value::Null, Value::Long(0)],
                            &fields,
                        )
                        .unwrap();
                    instance.params()[1].clone()
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(results, (0..4).map(Value::Long).collect::<Vec<_>>());
    }
}
