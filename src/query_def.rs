use crate::access::{IndexUse, TableAccess, TableDef};
use crate::expr::{Expr, FieldRef, Value};
use crate::table_map::{TableNo, MAX_TABLES};
use itertools::Itertools;
use std::fmt;
use std::sync::Arc;

/// Position of an operation in its query definition. The root is always operation 0.
pub type OpId = usize;

/// A key or filter operand of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Const(Value),
    /// Parameter supplied with each query instance.
    Param(usize),
    /// Value of `field` in the current row of the ancestor operation `op`.
    Linked { op: OpId, field: FieldRef },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    PrimaryKeyLookup,
    UniqueKeyLookup { index: IndexUse },
    IndexScan { index: IndexUse },
    TableScan,
}

/// How rows of an operation are combined with rows of its parent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum MatchType {
    InnerJoin,
    /// Parent rows without a match are returned NULL extended.
    #[default]
    Outer,
    /// Only the first match per parent row is returned.
    FirstMatch,
    /// Only parent rows without any match are returned.
    NullOnly,
}

#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    pub parent: Option<OpId>,
    pub match_type: MatchType,
    pub filter: Option<Expr>,
    /// Operands for the fields of other tables and the parameters in `filter`, in order of
    /// first appearance.
    pub filter_operands: Vec<Operand>,
}

#[derive(Debug, Clone)]
pub struct OperationDef {
    pub id: OpId,
    pub table_no: TableNo,
    pub alias: String,
    pub table: Arc<TableDef>,
    pub kind: OpKind,
    pub keys: Vec<Operand>,
    pub parent: Option<OpId>,
    pub match_type: MatchType,
    pub filter: Option<Expr>,
    pub filter_operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    NullConstant,
    UnknownOperation(OpId),
    UnknownIndex(String),
    KeyCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },
    NoParent(String),
    NotAncestor { op: OpId, referred: OpId },
    TooManyOperations(usize),
    Empty,
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Failure to bind the parameters of one execution of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceError {
    ParamCount { expected: usize, actual: usize },
    MissingParam(usize),
    MissingField(String),
    NullField(String),
    /// Only the handler of the root table executes the pushed join.
    NotPushedRoot(String),
}

/// Builds the operation tree of a composite query. Operations are appended in an order where
/// every parent precedes its children.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    ops: Vec<OperationDef>,
}

/// The immutable operation tree of a composite query.
#[derive(Debug, Clone)]
pub struct QueryDef {
    ops: Vec<OperationDef>,
    param_count: usize,
}

/// One execution of a query definition. Owns its parameter values, the definition is shared.
#[derive(Debug, Clone)]
pub struct QueryInstance {
    def: Arc<QueryDef>,
    params: Vec<Value>,
}

impl OpKind {
    pub fn is_scan(&self) -> bool {
        matches!(self, OpKind::IndexScan { .. } | OpKind::TableScan)
    }
}

impl Operand {
    fn linked_op(&self) -> Option<OpId> {
        match self {
            Operand::Linked { op, .. } => Some(*op),
            _ => None,
        }
    }

    fn param_no(&self) -> Option<usize> {
        match self {
            Operand::Param(num) => Some(*num),
            _ => None,
        }
    }
}

impl QueryBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn const_value(&self, val: Value) -> Result<Operand> {
        if val.is_null() {
            Err(BuildError::NullConstant)
        } else {
            Ok(Operand::Const(val))
        }
    }

    pub fn param_value(&self, param_no: usize) -> Operand {
        Operand::Param(param_no)
    }

    pub fn linked_value(&self, op: OpId, field: FieldRef) -> Result<Operand> {
        if op < self.ops.len() {
            Ok(Operand::Linked { op, field })
        } else {
            Err(BuildError::UnknownOperation(op))
        }
    }

    pub fn read_tuple(
        &mut self,
        table_no: TableNo,
        access: &TableAccess,
        keys: Vec<Operand>,
        options: OperationOptions,
    ) -> Result<OpId> {
        let expected = access.table.primary_key.len();
        check_key_count(access, expected, keys.len(), true)?;
        self.add_operation(table_no, access, OpKind::PrimaryKeyLookup, keys, options)
    }

    pub fn unique_index_read(
        &mut self,
        table_no: TableNo,
        access: &TableAccess,
        index: IndexUse,
        keys: Vec<Operand>,
        options: OperationOptions,
    ) -> Result<OpId> {
        if !access.table.is_unique(index) {
            return Err(BuildError::UnknownIndex(format!(
                "{} has no unique index {:?}",
                access.alias, index
            )));
        }
        let expected = index_column_count(access, index)?;
        check_key_count(access, expected, keys.len(), true)?;
        self.add_operation(table_no, access, OpKind::UniqueKeyLookup { index }, keys, options)
    }

    /// Range scan of an ordered index. The keys bound a prefix of the index columns.
    pub fn scan_index(
        &mut self,
        table_no: TableNo,
        access: &TableAccess,
        index: IndexUse,
        keys: Vec<Operand>,
        options: OperationOptions,
    ) -> Result<OpId> {
        let expected = index_column_count(access, index)?;
        check_key_count(access, expected, keys.len(), false)?;
        self.add_operation(table_no, access, OpKind::IndexScan { index }, keys, options)
    }

    pub fn scan_table(
        &mut self,
        table_no: TableNo,
        access: &TableAccess,
        options: OperationOptions,
    ) -> Result<OpId> {
        self.add_operation(table_no, access, OpKind::TableScan, vec![], options)
    }

    fn add_operation(
        &mut self,
        table_no: TableNo,
        access: &TableAccess,
        kind: OpKind,
        keys: Vec<Operand>,
        options: OperationOptions,
    ) -> Result<OpId> {
        let id = self.ops.len();
        if id >= MAX_TABLES {
            return Err(BuildError::TooManyOperations(id + 1));
        }
        for op in keys
            .iter()
            .chain(options.filter_operands.iter())
            .filter_map(|operand| operand.linked_op())
        {
            if op >= id {
                return Err(BuildError::UnknownOperation(op));
            }
        }
        if let Some(parent) = options.parent {
            if parent >= id {
                return Err(BuildError::UnknownOperation(parent));
            }
        }

        // Without an explicit parent, the operation becomes a child of the latest operation it
        // refers to.
        let parent = options
            .parent
            .or_else(|| Self::implicit_parent(&keys, &options.filter_operands));
        if parent.is_none() && id > 0 {
            return Err(BuildError::NoParent(access.alias.clone()));
        }

        self.ops.push(OperationDef {
            id,
            table_no,
            alias: access.alias.clone(),
            table: access.table.clone(),
            kind,
            keys,
            parent,
            match_type: options.match_type,
            filter: options.filter,
            filter_operands: options.filter_operands,
        });
        Ok(id)
    }

    /// Parent an operation with these operands gets when none is given explicitly.
    pub fn implicit_parent(keys: &[Operand], filter_operands: &[Operand]) -> Option<OpId> {
        keys.iter()
            .chain(filter_operands.iter())
            .filter_map(|operand| operand.linked_op())
            .max()
    }

    pub fn prepare(self) -> Result<QueryDef> {
        if self.ops.is_empty() {
            return Err(BuildError::Empty);
        }
        for op in &self.ops {
            for referred in op
                .keys
                .iter()
                .chain(op.filter_operands.iter())
                .filter_map(|operand| operand.linked_op())
            {
                if !is_ancestor(&self.ops, referred, op.id) {
                    return Err(BuildError::NotAncestor {
                        op: op.id,
                        referred,
                    });
                }
            }
        }
        let param_count = self
            .ops
            .iter()
            .flat_map(|op| op.keys.iter().chain(op.filter_operands.iter()))
            .filter_map(|operand| operand.param_no())
            .max()
            .map_or(0, |num| num + 1);
        Ok(QueryDef {
            ops: self.ops,
            param_count,
        })
    }
}

fn index_column_count(access: &TableAccess, index: IndexUse) -> Result<usize> {
    access
        .table
        .index_columns(index)
        .map(|columns| columns.len())
        .ok_or_else(|| BuildError::UnknownIndex(format!("{} index {:?}", access.alias, index)))
}

fn check_key_count(
    access: &TableAccess,
    expected: usize,
    actual: usize,
    exact: bool,
) -> Result<()> {
    if actual > expected || (exact && actual != expected) {
        Err(BuildError::KeyCountMismatch {
            table: access.alias.clone(),
            expected,
            actual,
        })
    } else {
        Ok(())
    }
}

fn is_ancestor(ops: &[OperationDef], ancestor: OpId, op: OpId) -> bool {
    let mut cur = ops[op].parent;
    while let Some(parent) = cur {
        if parent == ancestor {
            return true;
        }
        cur = ops[parent].parent;
    }
    false
}

impl QueryDef {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn operation(&self, op: OpId) -> Option<&OperationDef> {
        self.ops.get(op)
    }

    pub fn operations(&self) -> &[OperationDef] {
        &self.ops
    }

    pub fn root(&self) -> &OperationDef {
        &self.ops[0]
    }

    pub fn children(&self, op: OpId) -> impl Iterator<Item = &OperationDef> {
        self.ops.iter().filter(move |child| child.parent == Some(op))
    }

    /// Number of parameters each query instance has to supply.
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn has_scan_children(&self) -> bool {
        self.ops.iter().skip(1).any(|op| op.kind.is_scan())
    }

    fn make_tree(&self, op: &OperationDef) -> termtree::Tree<String> {
        termtree::Tree::new(op.to_string())
            .with_leaves(self.children(op.id).map(|child| self.make_tree(child)))
    }
}

impl QueryInstance {
    pub fn new(def: Arc<QueryDef>, params: Vec<Value>) -> std::result::Result<Self, InstanceError> {
        if params.len() != def.param_count() {
            return Err(InstanceError::ParamCount {
                expected: def.param_count(),
                actual: params.len(),
            });
        }
        Ok(Self { def, params })
    }

    pub fn query_def(&self) -> &QueryDef {
        &self.def
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Key values of `op` known before the query is sent. Linked keys are `None`, their values
    /// are only known to the storage nodes.
    pub fn bound_keys(&self, op: OpId) -> Option<Vec<Option<Value>>> {
        let op = self.def.operation(op)?;
        Some(
            op.keys
                .iter()
                .map(|key| match key {
                    Operand::Const(val) => Some(val.clone()),
                    Operand::Param(num) => self.params.get(*num).cloned(),
                    Operand::Linked { .. } => None,
                })
                .collect(),
        )
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Const(val) => write!(f, "{}", val),
            Operand::Param(num) => write!(f, "?{}", num),
            Operand::Linked { op, field } => write!(f, "linked(#{} {})", op, field),
        }
    }
}

impl fmt::Display for OperationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index_name =
            |index: &IndexUse| self.table.index_name(*index).unwrap_or("?").to_string();
        let kind = match &self.kind {
            OpKind::PrimaryKeyLookup => "read_tuple".to_string(),
            OpKind::UniqueKeyLookup { index } => {
                format!("unique_index_read on {}", index_name(index))
            }
            OpKind::IndexScan { index } => format!("scan_index on {}", index_name(index)),
            OpKind::TableScan => "scan_table".to_string(),
        };
        write!(f, "#{} {} {}", self.id, self.alias, kind)?;
        if !self.keys.is_empty() {
            write!(f, " key=({})", self.keys.iter().join(", "))?;
        }
        if self.id > 0 {
            write!(f, " {}", self.match_type)?;
        }
        if let Some(filter) = &self.filter {
            write!(f, " filter={}", filter)?;
        }
        Ok(())
    }
}

impl From<&QueryDef> for termtree::Tree<String> {
    fn from(def: &QueryDef) -> Self {
        def.make_tree(def.root())
    }
}

impl fmt::Display for QueryDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", termtree::Tree::<String>::from(self))
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::NullConstant => write!(f, "NULL constant in operation key"),
            BuildError::UnknownOperation(op) => write!(f, "unknown operation #{}", op),
            BuildError::UnknownIndex(msg) => write!(f, "unknown index: {}", msg),
            BuildError::KeyCountMismatch {
                table,
                expected,
                actual,
            } => write!(
                f,
                "operation on {} has {} key values, expected {}",
                table, actual, expected
            ),
            BuildError::NoParent(table) => write!(f, "operation on {} has no parent", table),
            BuildError::NotAncestor { op, referred } => write!(
                f,
                "operation #{} refers #{} which is not one of its ancestors",
                op, referred
            ),
            BuildError::TooManyOperations(count) => {
                write!(f, "{} operations exceed the limit of {}", count, MAX_TABLES)
            }
            BuildError::Empty => write!(f, "query has no operations"),
        }
    }
}

impl std::error::Error for BuildError {}

impl fmt::Display for InstanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceError::ParamCount { expected, actual } => {
                write!(f, "got {} parameters, query needs {}", actual, expected)
            }
            InstanceError::MissingParam(num) => write!(f, "statement parameter {} is missing", num),
            InstanceError::MissingField(field) => write!(f, "no value for field {}", field),
            InstanceError::NullField(field) => write!(f, "field {} is NULL", field),
            InstanceError::NotPushedRoot(table) => {
                write!(f, "table {} is not the root of a pushed join", table)
            }
        }
    }
}

impl std::error::Error for InstanceError {}
