use std::fmt;

/// Position of a table in the left-deep join order of a query plan.
pub type TableNo = usize;

pub const MAX_TABLES: usize = u64::BITS as usize;

/// A set of tables of one query plan. All operations are single word operations, so the map is
/// passed around by value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableMap(u64);

impl TableMap {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn single(tab_no: TableNo) -> Self {
        let mut map = Self::new();
        map.add(tab_no);
        map
    }

    /// All tables in `first..=last`.
    pub fn range(first: TableNo, last: TableNo) -> Self {
        if first > last || first >= MAX_TABLES {
            return Self::new();
        }
        let mut map = Self::new();
        map.set_prefix(last.min(MAX_TABLES - 1) + 1);
        map.0 &= !Self::prefix_bits(first);
        map
    }

    fn prefix_bits(n: usize) -> u64 {
        if n >= MAX_TABLES {
            u64::MAX
        } else {
            (1u64 << n) - 1
        }
    }

    /// Sets the map to all tables `< n`.
    pub fn set_prefix(&mut self, n: usize) {
        self.0 = Self::prefix_bits(n);
    }

    pub fn add(&mut self, tab_no: TableNo) {
        debug_assert!(tab_no < MAX_TABLES);
        self.0 |= 1u64 << tab_no;
    }

    pub fn add_map(&mut self, other: TableMap) {
        self.0 |= other.0;
    }

    pub fn contain(&self, tab_no: TableNo) -> bool {
        tab_no < MAX_TABLES && self.0 & (1u64 << tab_no) != 0
    }

    pub fn contain_map(&self, other: TableMap) -> bool {
        other.0 & !self.0 == 0
    }

    /// First member at or after `start`.
    pub fn first_table(&self, start: TableNo) -> Option<TableNo> {
        if start >= MAX_TABLES {
            return None;
        }
        let bits = self.0 & !Self::prefix_bits(start);
        (bits != 0).then(|| bits.trailing_zeros() as TableNo)
    }

    /// Last member at or before `start`.
    pub fn last_table(&self, start: TableNo) -> Option<TableNo> {
        let bits = self.0 & Self::prefix_bits(start.saturating_add(1));
        (bits != 0).then(|| (u64::BITS - 1 - bits.leading_zeros()) as TableNo)
    }

    pub fn intersect(&mut self, other: TableMap) {
        self.0 &= other.0;
    }

    pub fn subtract(&mut self, other: TableMap) {
        self.0 &= !other.0;
    }

    pub fn clear_bit(&mut self, tab_no: TableNo) {
        if tab_no < MAX_TABLES {
            self.0 &= !(1u64 << tab_no);
        }
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    pub fn is_clear_all(&self) -> bool {
        self.0 == 0
    }

    pub fn is_overlapping(&self, other: TableMap) -> bool {
        self.0 & other.0 != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = TableNo> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let tab_no = bits.trailing_zeros() as TableNo;
                bits &= bits - 1;
                Some(tab_no)
            }
        })
    }

    pub fn intersection(mut self, other: TableMap) -> Self {
        self.intersect(other);
        self
    }

    pub fn union(mut self, other: TableMap) -> Self {
        self.add_map(other);
        self
    }

    pub fn difference(mut self, other: TableMap) -> Self {
        self.subtract(other);
        self
    }
}

impl FromIterator<TableNo> for TableMap {
    fn from_iter<T: IntoIterator<Item = TableNo>>(iter: T) -> Self {
        let mut map = Self::new();
        for tab_no in iter {
            map.add(tab_no);
        }
        map
    }
}

impl fmt::Display for TableMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", itertools::join(self.iter(), ","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_and_last() {
        let map: TableMap = [2, 5, 9].into_iter().collect();
        assert_eq!(map.first_table(0), Some(2));
        assert_eq!(map.first_table(3), Some(5));
        assert_eq!(map.first_table(5), Some(5));
        assert_eq!(map.first_table(10), None);
        assert_eq!(map.last_table(63), Some(9));
        assert_eq!(map.last_table(8), Some(5));
        assert_eq!(map.last_table(1), None);
        assert_eq!(TableMap::new().first_table(0), None);
        assert_eq!(TableMap::single(63).last_table(usize::MAX), Some(63));
    }

    #[test]
    fn prefix_and_range() {
        let mut map = TableMap::new();
        map.set_prefix(3);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
        map.set_prefix(MAX_TABLES);
        assert_eq!(map.len(), MAX_TABLES);
        assert_eq!(TableMap::range(2, 4).iter().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert!(TableMap::range(4, 2).is_clear_all());
        assert_eq!(TableMap::range(62, 63).len(), 2);
    }

    #[test]
    fn set_ops() {
        let a: TableMap = [1, 2, 3].into_iter().collect();
        let b: TableMap = [3, 4].into_iter().collect();
        assert!(a.is_overlapping(b));
        assert_eq!(a.intersection(b), TableMap::single(3));
        assert_eq!(a.difference(b).to_string(), "{1,2}");
        assert!(a.union(b).contain_map(a));
        assert!(!a.contain_map(b));

        let mut c = a;
        c.clear_bit(2);
        assert!(!c.contain(2));
        assert!(c.contain(1));
        c.clear_all();
        assert!(c.is_clear_all());
        assert!(!c.contain(MAX_TABLES + 3));
    }
}
