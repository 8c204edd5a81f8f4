use crate::access::{AccessType, QueryPlan, TableAccess};
use crate::expr::Expr;
use crate::query_def::OpId;
use crate::table_map::{TableMap, TableNo};

pub(super) const PUSHABILITY_KNOWN: u8 = 0x01;
pub(super) const PUSHABLE_AS_PARENT: u8 = 0x02;
pub(super) const PUSHABLE_AS_CHILD: u8 = 0x04;

/// Planner state of one plan table.
#[derive(Debug, Clone)]
pub struct PushedTable {
    pub tab_no: TableNo,
    pub access_type: AccessType,

    pub first_inner: TableNo,
    pub last_inner: TableNo,
    pub first_upper: Option<TableNo>,
    pub first_sj_inner: Option<TableNo>,
    pub last_sj_inner: Option<TableNo>,
    pub first_sj_upper: Option<TableNo>,
    pub first_anti_inner: Option<TableNo>,

    /// Preceding tables of the same inner join nest level.
    pub inner_nest: TableMap,
    /// Tables of all the nests embedding this table's nest.
    pub upper_nests: TableMap,
    pub sj_nest: TableMap,

    /// Per key part, the pushed tables which could supply its value.
    pub key_parents: Vec<TableMap>,
    /// First tables of the nests this table is outer, semi or anti joined to.
    pub nest_parents: TableMap,
    /// Pushed tables referred by the pushed condition.
    pub cond_parents: TableMap,
    /// Mandatory ancestors while classifying, the full ancestor chain after optimization.
    pub ancestors: TableMap,
    /// Tables which may become ancestors of this table without changing the join semantics.
    pub ancestor_nests: TableMap,
    pub parent: Option<TableNo>,
    pub op: Option<OpId>,
    pub properties: u8,

    pub pushed_cond: Option<Expr>,
    pub pending_cond: Option<Expr>,
}

impl PushedTable {
    pub fn new(tab_no: TableNo, access: &TableAccess) -> Self {
        Self {
            tab_no,
            access_type: access.access_type,
            first_inner: access.first_inner,
            last_inner: access.last_inner,
            first_upper: access.first_upper,
            first_sj_inner: access.first_sj_inner,
            last_sj_inner: access.last_sj_inner,
            first_sj_upper: access.first_sj_upper,
            first_anti_inner: access.first_anti_inner,
            inner_nest: TableMap::new(),
            upper_nests: TableMap::new(),
            sj_nest: TableMap::new(),
            key_parents: vec![],
            nest_parents: TableMap::new(),
            cond_parents: TableMap::new(),
            ancestors: TableMap::new(),
            ancestor_nests: TableMap::new(),
            parent: None,
            op: None,
            properties: 0,
            pushed_cond: None,
            pending_cond: None,
        }
    }

    /// Creates the descriptors of all plan tables with their nest maps.
    pub fn for_plan(plan: &QueryPlan) -> Vec<Self> {
        let mut tables: Vec<_> = plan
            .tables()
            .iter()
            .enumerate()
            .map(|(tab_no, access)| Self::new(tab_no, access))
            .collect();

        for tab_no in 0..tables.len() {
            let first_inner = tables[tab_no].first_inner;
            let inner_nest = (0..tab_no)
                .filter(|&other| tables[other].first_inner == first_inner)
                .collect();

            // Tables of a nest share the upper nests of the nest's first table.
            let upper_nests = if first_inner < tab_no {
                tables[first_inner].upper_nests
            } else {
                match tables[tab_no].first_upper {
                    Some(first_upper) if tab_no > 0 => {
                        let upper: TableMap = (0..tab_no)
                            .filter(|&other| tables[other].first_inner == first_upper)
                            .collect();
                        upper.union(tables[first_upper].upper_nests)
                    }
                    _ => TableMap::new(),
                }
            };

            let sj_nest = match (tables[tab_no].first_sj_inner, tables[tab_no].last_sj_inner) {
                (Some(first), Some(last)) => TableMap::range(first, last),
                _ => TableMap::new(),
            };

            let table = &mut tables[tab_no];
            table.inner_nest = inner_nest;
            table.upper_nests = upper_nests;
            table.sj_nest = sj_nest;
        }
        tables
    }

    /// Clears the state of a previous root. Cached pushability verdicts are kept.
    pub fn reset(&mut self) {
        self.key_parents.clear();
        self.nest_parents.clear_all();
        self.cond_parents.clear_all();
        self.ancestors.clear_all();
        self.ancestor_nests.clear_all();
        self.parent = None;
        self.op = None;
        self.pushed_cond = None;
        self.pending_cond = None;
    }

    /// All preceding tables this table is joined with: its own nest level and every embedding
    /// nest.
    pub fn embedding_nests(&self) -> TableMap {
        self.inner_nest.union(self.upper_nests)
    }

    pub fn is_inner_joined_to(&self, other: TableNo) -> bool {
        self.inner_nest.contain(other)
    }

    pub fn is_lookup(&self) -> bool {
        self.access_type.is_lookup()
    }

    pub fn is_scan(&self) -> bool {
        self.access_type.is_scan()
    }

    /// Union of all key parent sets.
    pub fn all_parents(&self) -> TableMap {
        self.key_parents
            .iter()
            .fold(TableMap::new(), |acc, parents| acc.union(*parents))
    }

    /// Tables a key part can only be taken from when it is taken from the first candidate.
    pub fn first_parents(&self) -> TableMap {
        self.key_parents
            .iter()
            .filter_map(|parents| parents.first_table(0))
            .collect()
    }

    /// Ancestors needed regardless of which key parents are chosen.
    pub fn mandatory_parents(&self) -> TableMap {
        self.first_parents()
            .union(self.nest_parents)
            .union(self.cond_parents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::build_plan;
    use pretty_assertions::assert_eq;

    #[test]
    fn nest_maps() {
        // t0, t1 LEFT JOIN (t2, t3 LEFT JOIN (t4)), t5
        let plan = build_plan(
            "CREATE TABLE t (pk INT PRIMARY KEY, a INT, KEY ix_a (a));
             ACCESS t AS t0 table_scan;
             ACCESS t AS t1 primary_key INDEX PRIMARY KEY (t0.a);
             ACCESS t AS t2 primary_key INDEX PRIMARY KEY (t1.a);
             ACCESS t AS t3 primary_key INDEX PRIMARY KEY (t2.a);
             ACCESS t AS t4 primary_key INDEX PRIMARY KEY (t3.a);
             ACCESS t AS t5 primary_key INDEX PRIMARY KEY (t0.a);
             OUTER t2 TO t4;
             OUTER t4 TO t4;",
        );
        let tables = PushedTable::for_plan(&plan);
        let map = |tab_nos: &[TableNo]| tab_nos.iter().copied().collect::<TableMap>();

        assert_eq!(tables[1].inner_nest, map(&[0]));
        assert_eq!(tables[1].upper_nests, map(&[]));
        assert_eq!(tables[5].inner_nest, map(&[0, 1]));
        assert_eq!(tables[3].inner_nest, map(&[2]));
        assert_eq!(tables[3].upper_nests, map(&[0, 1]));
        assert_eq!(tables[2].upper_nests, tables[3].upper_nests);
        assert_eq!(tables[4].inner_nest, map(&[]));
        assert_eq!(tables[4].upper_nests, map(&[0, 1, 2, 3]));
        assert_eq!(tables[4].embedding_nests(), map(&[0, 1, 2, 3]));
        assert!(tables[3].is_inner_joined_to(2));
        assert!(!tables[2].is_inner_joined_to(1));
    }

    #[test]
    fn semi_join_nest() {
        let plan = build_plan(
            "CREATE TABLE t (pk INT PRIMARY KEY, a INT, KEY ix_a (a));
             ACCESS t AS t0 table_scan;
             ACCESS t AS t1 ordered_index_scan INDEX ix_a KEY (t0.pk);
             ACCESS t AS t2 primary_key INDEX PRIMARY KEY (t1.a);
             SEMI t1 TO t2;",
        );
        let tables = PushedTable::for_plan(&plan);
        assert_eq!(tables[2].sj_nest.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(tables[0].sj_nest.is_clear_all());
        // Semi joined tables stay at the top nest level.
        assert_eq!(tables[2].inner_nest.iter().collect::<Vec<_>>(), vec![0, 1]);
    }
}
