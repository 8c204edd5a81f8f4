use crate::equality::EqualitySets;
use crate::expr::{DataType, Expr};
use crate::table_map::{TableNo, MAX_TABLES};
use itertools::Itertools;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StorageEngine {
    #[strum(to_string = "ndbcluster", serialize = "ndb")]
    Ndb,
    #[strum(serialize = "innodb")]
    InnoDb,
    #[strum(serialize = "myisam")]
    MyIsam,
    Memory,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

/// An ordered index, possibly unique. Unique indexes can also be used for lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<usize>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub engine: StorageEngine,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<usize>,
    pub indexes: Vec<IndexDef>,
    pub user_partitioned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexUse {
    Primary,
    Index(usize),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum AccessType {
    /// Table with at most one row, read before the join starts.
    Fixed,
    PrimaryKey,
    UniqueKey,
    OrderedIndexScan,
    MultiRangePrimaryKey,
    MultiRangeUniqueKey,
    MultiRangeMixed,
    TableScan,
    Undecided,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum JoinNestKind {
    Outer,
    Semi,
    Anti,
}

/// A consecutive range of tables sharing the same join type relative to the tables before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinNest {
    pub kind: JoinNestKind,
    pub first: TableNo,
    pub last: TableNo,
}

/// One table access of the plan, in join order.
#[derive(Debug, Clone)]
pub struct TableAccess {
    pub alias: String,
    pub table: Arc<TableDef>,
    pub access_type: AccessType,
    pub index: Option<IndexUse>,
    pub key_fields: Vec<Expr>,
    pub condition: Option<Expr>,
    /// Filter evaluated on top of the nest starting with this table.
    pub nest_condition: Option<Expr>,
    pub rows: f64,
    pub select_no: usize,
    pub use_order: bool,
    pub reads_blobs: bool,
    pub for_update: bool,

    // Nest topology, filled in by `QueryPlan::new`.
    pub first_inner: TableNo,
    pub last_inner: TableNo,
    pub first_upper: Option<TableNo>,
    pub first_sj_inner: Option<TableNo>,
    pub last_sj_inner: Option<TableNo>,
    pub first_sj_upper: Option<TableNo>,
    pub first_anti_inner: Option<TableNo>,
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    tables: Vec<TableAccess>,
    nests: Vec<JoinNest>,
    equalities: EqualitySets,
}

#[derive(Debug)]
pub enum PlanError {
    TooManyTables(usize),
    Nest(String),
    Key(String),
}

pub type Result<T> = std::result::Result<T, PlanError>;

impl StorageEngine {
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or(StorageEngine::Other)
    }
}

impl TableDef {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            engine: StorageEngine::Ndb,
            columns,
            primary_key: vec![],
            indexes: vec![],
            user_partitioned: false,
        }
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|col| col.name.eq_ignore_ascii_case(name))
    }

    pub fn find_index(&self, name: &str) -> Option<IndexUse> {
        if name.eq_ignore_ascii_case("primary") {
            return (!self.primary_key.is_empty()).then_some(IndexUse::Primary);
        }
        self.indexes
            .iter()
            .position(|index| index.name.eq_ignore_ascii_case(name))
            .map(IndexUse::Index)
    }

    pub fn index_columns(&self, index: IndexUse) -> Option<&[usize]> {
        match index {
            IndexUse::Primary => Some(self.primary_key.as_slice()),
            IndexUse::Index(idx) => self.indexes.get(idx).map(|index| index.columns.as_slice()),
        }
    }

    pub fn index_name(&self, index: IndexUse) -> Option<&str> {
        match index {
            IndexUse::Primary => Some("PRIMARY"),
            IndexUse::Index(idx) => self.indexes.get(idx).map(|index| index.name.as_str()),
        }
    }

    pub fn is_unique(&self, index: IndexUse) -> bool {
        match index {
            IndexUse::Primary => true,
            IndexUse::Index(idx) => self.indexes.get(idx).map_or(false, |index| index.unique),
        }
    }
}

impl AccessType {
    pub fn is_lookup(&self) -> bool {
        matches!(self, AccessType::PrimaryKey | AccessType::UniqueKey)
    }

    pub fn is_scan(&self) -> bool {
        matches!(
            self,
            AccessType::OrderedIndexScan
                | AccessType::MultiRangePrimaryKey
                | AccessType::MultiRangeUniqueKey
                | AccessType::MultiRangeMixed
                | AccessType::TableScan
        )
    }

    /// Number of operations the storage nodes need for one access of this type. Unique index
    /// lookups go through the index table before reading the base table.
    pub fn internal_op_count(&self) -> usize {
        match self {
            AccessType::UniqueKey => 2,
            _ => 1,
        }
    }
}

impl TableAccess {
    pub fn new(alias: impl Into<String>, table: Arc<TableDef>, access_type: AccessType) -> Self {
        Self {
            alias: alias.into(),
            table,
            access_type,
            index: None,
            key_fields: vec![],
            condition: None,
            nest_condition: None,
            rows: 1.,
            select_no: 1,
            use_order: false,
            reads_blobs: false,
            for_update: false,
            first_inner: 0,
            last_inner: 0,
            first_upper: None,
            first_sj_inner: None,
            last_sj_inner: None,
            first_sj_upper: None,
            first_anti_inner: None,
        }
    }

    pub fn with_index(mut self, index: IndexUse) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_keys(mut self, key_fields: Vec<Expr>) -> Self {
        self.key_fields = key_fields;
        self
    }

    pub fn with_condition(mut self, condition: Expr) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_nest_condition(mut self, condition: Expr) -> Self {
        self.nest_condition = Some(condition);
        self
    }

    pub fn with_rows(mut self, rows: f64) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_select_no(mut self, select_no: usize) -> Self {
        self.select_no = select_no;
        self
    }

    pub fn set_use_order(mut self, use_order: bool) -> Self {
        self.use_order = use_order;
        self
    }

    pub fn set_reads_blobs(mut self, reads_blobs: bool) -> Self {
        self.reads_blobs = reads_blobs;
        self
    }

    pub fn set_for_update(mut self, for_update: bool) -> Self {
        self.for_update = for_update;
        self
    }

    pub fn key_columns(&self) -> &[usize] {
        self.index
            .and_then(|index| self.table.index_columns(index))
            .unwrap_or(&[])
    }

    /// The column matched by key part `key_part_no`.
    pub fn key_column(&self, key_part_no: usize) -> Option<&ColumnDef> {
        self.key_columns()
            .get(key_part_no)
            .and_then(|&col| self.table.columns.get(col))
    }

    pub fn index_name(&self) -> Option<&str> {
        self.index.and_then(|index| self.table.index_name(index))
    }
}

impl QueryPlan {
    pub fn new(
        mut tables: Vec<TableAccess>,
        nests: Vec<JoinNest>,
        equalities: EqualitySets,
    ) -> Result<Self> {
        if tables.len() > MAX_TABLES {
            return Err(PlanError::TooManyTables(tables.len()));
        }
        validate_nests(tables.len(), &nests)?;
        for (tab_no, table) in tables.iter().enumerate() {
            validate_keys(tab_no, table)?;
        }

        let last_no = tables.len().saturating_sub(1);
        for (tab_no, table) in tables.iter_mut().enumerate() {
            match innermost_nest(&nests, tab_no, |nest| nest.kind != JoinNestKind::Semi) {
                Some(nest) => {
                    table.first_inner = nest.first;
                    table.last_inner = nest.last;
                    table.first_upper = Some(enclosing_first(&nests, &nest));
                }
                None => {
                    table.first_inner = 0;
                    table.last_inner = last_no;
                    table.first_upper = None;
                }
            }

            let semi = innermost_nest(&nests, tab_no, |nest| nest.kind == JoinNestKind::Semi);
            table.first_sj_inner = semi.map(|nest| nest.first);
            table.last_sj_inner = semi.map(|nest| nest.last);
            table.first_sj_upper = semi.map(|nest| enclosing_first(&nests, &nest));

            table.first_anti_inner =
                innermost_nest(&nests, tab_no, |nest| nest.kind == JoinNestKind::Anti)
                    .map(|nest| nest.first);
        }

        Ok(Self {
            tables,
            nests,
            equalities,
        })
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, tab_no: TableNo) -> &TableAccess {
        &self.tables[tab_no]
    }

    pub fn tables(&self) -> &[TableAccess] {
        &self.tables
    }

    pub fn nests(&self) -> &[JoinNest] {
        &self.nests
    }

    pub fn equalities(&self) -> &EqualitySets {
        &self.equalities
    }

    pub fn find_table(&self, alias: &str) -> Option<TableNo> {
        self.tables
            .iter()
            .position(|table| table.alias.eq_ignore_ascii_case(alias))
    }

    /// Nests ending exactly at `tab_no`, innermost first.
    pub fn nests_ending_at(&self, tab_no: TableNo) -> Vec<JoinNest> {
        self.nests
            .iter()
            .filter(|nest| nest.last == tab_no)
            .sorted_by_key(|nest| std::cmp::Reverse(nest.first))
            .copied()
            .collect()
    }
}

// Nests are properly nested with distinct starts, so the innermost of all nests containing a
// table is the one starting last.
fn innermost_nest(
    nests: &[JoinNest],
    tab_no: TableNo,
    filter: impl Fn(&JoinNest) -> bool,
) -> Option<JoinNest> {
    nests
        .iter()
        .filter(|nest| filter(nest) && nest.first <= tab_no && tab_no <= nest.last)
        .max_by_key(|nest| nest.first)
        .copied()
}

/// First table of the outer join level embedding `inner`, the first plan table at top level.
fn enclosing_first(nests: &[JoinNest], inner: &JoinNest) -> TableNo {
    nests
        .iter()
        .filter(|nest| {
            nest.kind != JoinNestKind::Semi
                && nest.first < inner.first
                && inner.last <= nest.last
        })
        .max_by_key(|nest| nest.first)
        .map_or(0, |nest| nest.first)
}

fn validate_nests(count: usize, nests: &[JoinNest]) -> Result<()> {
    for nest in nests {
        if nest.first > nest.last || nest.last >= count {
            return Err(PlanError::Nest(format!(
                "{} nest {}..{} out of range",
                nest.kind, nest.first, nest.last
            )));
        }
        if nest.first == 0 {
            return Err(PlanError::Nest(format!(
                "{} nest can not start at the first table",
                nest.kind
            )));
        }
    }
    for (a, b) in nests.iter().tuple_combinations() {
        if a.first == b.first {
            return Err(PlanError::Nest(format!(
                "{} and {} nests both start at table {}",
                a.kind, b.kind, a.first
            )));
        }
        let disjoint = a.last < b.first || b.last < a.first;
        let nested =
            (a.first <= b.first && b.last <= a.last) || (b.first <= a.first && a.last <= b.last);
        if !disjoint && !nested {
            return Err(PlanError::Nest(format!(
                "nests {}..{} and {}..{} overlap",
                a.first, a.last, b.first, b.last
            )));
        }
    }
    Ok(())
}

fn validate_keys(tab_no: TableNo, table: &TableAccess) -> Result<()> {
    let key_count = table.key_fields.len();
    let needs_index = !matches!(
        table.access_type,
        AccessType::TableScan | AccessType::Fixed | AccessType::Undecided | AccessType::Other
    );
    let columns = match table.index {
        Some(index) => table.table.index_columns(index).ok_or_else(|| {
            PlanError::Key(format!("table {} ({}) uses an unknown index", tab_no, table.alias))
        })?,
        None if needs_index => {
            return Err(PlanError::Key(format!(
                "{} access on {} needs an index",
                table.access_type, table.alias
            )));
        }
        None => &[],
    };

    match table.access_type {
        AccessType::PrimaryKey | AccessType::UniqueKey if key_count != columns.len() => {
            Err(PlanError::Key(format!(
                "lookup on {} has {} key fields, index has {} columns",
                table.alias,
                key_count,
                columns.len()
            )))
        }
        AccessType::UniqueKey if !table.index.map_or(false, |idx| table.table.is_unique(idx)) => {
            Err(PlanError::Key(format!(
                "unique key lookup on {} uses a non-unique index",
                table.alias
            )))
        }
        AccessType::TableScan if key_count > 0 => Err(PlanError::Key(format!(
            "table scan on {} has key fields",
            table.alias
        ))),
        _ if key_count > columns.len() && needs_index => Err(PlanError::Key(format!(
            "{} has more key fields than index columns",
            table.alias
        ))),
        _ => Ok(()),
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::TooManyTables(count) => {
                write!(f, "plan has {} tables, at most {} supported", count, MAX_TABLES)
            }
            PlanError::Nest(msg) => write!(f, "invalid join nest: {}", msg),
            PlanError::Key(msg) => write!(f, "invalid key: {}", msg),
        }
    }
}

impl std::error::Error for PlanError {}

impl fmt::Display for TableAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}", self.alias, self.access_type)?;
        if let Some(index) = self.index_name() {
            write!(f, " on {}", index)?;
        }
        if !self.key_fields.is_empty() {
            write!(f, ", key=({})", self.key_fields.iter().join(", "))?;
        }
        if let Some(cond) = &self.condition {
            write!(f, ", cond={}", cond)?;
        }
        write!(f, ", rows={})", self.rows)
    }
}

impl From<&QueryPlan> for termtree::Tree<String> {
    fn from(plan: &QueryPlan) -> Self {
        let mut tree = Self::new("QueryPlan".to_string())
            .with_leaves(plan.tables.iter().map(|table| table.to_string()));
        for nest in &plan.nests {
            tree.push(format!(
                "{} nest {}..{}",
                nest.kind, plan.tables[nest.first].alias, plan.tables[nest.last].alias
            ));
        }
        tree
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", termtree::Tree::<String>::from(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{FieldRef, Value};
    use pretty_assertions::assert_eq;

    fn table_def(name: &str) -> Arc<TableDef> {
        let mut def = TableDef::new(
            name,
            vec![
                ColumnDef {
                    name: "pk".to_string(),
                    data_type: DataType::Int,
                    nullable: false,
                },
                ColumnDef {
                    name: "a".to_string(),
                    data_type: DataType::Int,
                    nullable: true,
                },
            ],
        );
        def.primary_key = vec![0];
        def.indexes.push(IndexDef {
            name: "ix_a".to_string(),
            columns: vec![1],
            unique: false,
        });
        Arc::new(def)
    }

    fn scan(alias: &str) -> TableAccess {
        TableAccess::new(alias, table_def(alias), AccessType::TableScan)
    }

    fn lookup(alias: &str, parent: TableNo) -> TableAccess {
        TableAccess::new(alias, table_def(alias), AccessType::PrimaryKey)
            .with_index(IndexUse::Primary)
            .with_keys(vec![Expr::Field(FieldRef::new(parent, 1, "p.a"))])
    }

    #[test]
    fn nest_topology() {
        // t0, t1 LEFT JOIN (t2, t3 LEFT JOIN (t4)), t5 SEMI (t5)
        let tables = vec![
            scan("t0"),
            lookup("t1", 0),
            lookup("t2", 1),
            lookup("t3", 2),
            lookup("t4", 3),
            lookup("t5", 0),
        ];
        let nests = vec![
            JoinNest {
                kind: JoinNestKind::Outer,
                first: 2,
                last: 4,
            },
            JoinNest {
                kind: JoinNestKind::Anti,
                first: 4,
                last: 4,
            },
            JoinNest {
                kind: JoinNestKind::Semi,
                first: 5,
                last: 5,
            },
        ];
        let plan = QueryPlan::new(tables, nests, EqualitySets::new()).unwrap();

        let topology = |tab_no: TableNo| {
            let t = plan.table(tab_no);
            (t.first_inner, t.last_inner, t.first_upper)
        };
        assert_eq!(topology(0), (0, 5, None));
        assert_eq!(topology(1), (0, 5, None));
        assert_eq!(topology(2), (2, 4, Some(0)));
        assert_eq!(topology(3), (2, 4, Some(0)));
        assert_eq!(topology(4), (4, 4, Some(2)));
        assert_eq!(plan.table(4).first_anti_inner, Some(4));
        assert_eq!(plan.table(3).first_anti_inner, None);
        assert_eq!(plan.table(5).first_sj_inner, Some(5));
        assert_eq!(plan.table(5).first_sj_upper, Some(0));
        assert_eq!(
            plan.nests_ending_at(4)
                .iter()
                .map(|nest| nest.first)
                .collect::<Vec<_>>(),
            vec![4, 2]
        );
    }

    #[test]
    fn overlapping_nests_rejected() {
        let tables = vec![scan("t0"), lookup("t1", 0), lookup("t2", 1), lookup("t3", 2)];
        let nests = vec![
            JoinNest {
                kind: JoinNestKind::Outer,
                first: 1,
                last: 2,
            },
            JoinNest {
                kind: JoinNestKind::Outer,
                first: 2,
                last: 3,
            },
        ];
        assert!(matches!(
            QueryPlan::new(tables, nests, EqualitySets::new()),
            Err(PlanError::Nest(_))
        ));
    }

    #[test]
    fn lookup_key_count_checked() {
        let bad = TableAccess::new("t1", table_def("t1"), AccessType::PrimaryKey)
            .with_index(IndexUse::Primary)
            .with_keys(vec![
                Expr::Value(Value::Long(1)),
                Expr::Value(Value::Long(2)),
            ]);
        assert!(matches!(
            QueryPlan::new(vec![scan("t0"), bad], vec![], EqualitySets::new()),
            Err(PlanError::Key(_))
        ));
    }

    #[test]
    fn engine_names() {
        assert_eq!(StorageEngine::from_name("NDBCLUSTER"), StorageEngine::Ndb);
        assert_eq!(StorageEngine::from_name("ndb"), StorageEngine::Ndb);
        assert_eq!(StorageEngine::from_name("InnoDB"), StorageEngine::InnoDb);
        assert_eq!(StorageEngine::from_name("csv"), StorageEngine::Other);
    }

    #[test]
    fn display_plan() {
        let plan = QueryPlan::new(vec![scan("t0"), lookup("t1", 0)], vec![], EqualitySets::new())
            .unwrap();
        let text = plan.to_string();
        assert!(text.starts_with("QueryPlan"));
        assert!(text.contains("t0(table_scan, rows=1)"));
        assert!(text.contains("t1(primary_key on PRIMARY, key=(p.a), rows=1)"));
    }
}
