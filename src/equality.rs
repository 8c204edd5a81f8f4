use crate::expr::FieldRef;
use either::Either;
use itertools::Itertools;
use rustc_hash::FxHashMap;
use std::fmt;

/// Column equality classes known from the join and where conditions. Every field of a class is
/// transitively equal to every other field of the same class.
#[derive(Debug, Clone, Default)]
pub struct EqualitySets {
    classes: Vec<Vec<FieldRef>>,
    class_of: FxHashMap<FieldRef, usize>,
}

impl EqualitySets {
    pub fn new() -> Self {
        Default::default()
    }

    /// Declares all `fields` equal. Classes sharing a field with `fields` are merged.
    pub fn add_equal(&mut self, fields: impl IntoIterator<Item = FieldRef>) {
        let fields: Vec<_> = fields.into_iter().collect();
        let mut merged: Vec<usize> = fields
            .iter()
            .filter_map(|field| self.class_of.get(field).copied())
            .unique()
            .sorted_unstable()
            .collect();

        let target = match merged.first() {
            Some(&target) => target,
            None => {
                self.classes.push(vec![]);
                self.classes.len() - 1
            }
        };

        // Fold the other classes into the target. Drained classes stay behind as empty slots
        // so that indices in class_of remain stable.
        for idx in merged.drain(..).skip(1) {
            let moved = std::mem::take(&mut self.classes[idx]);
            for field in &moved {
                self.class_of.insert(field.clone(), target);
            }
            self.classes[target].extend(moved);
        }

        for field in fields {
            if !self.class_of.contains_key(&field) {
                self.class_of.insert(field.clone(), target);
                self.classes[target].push(field);
            }
        }
        self.classes[target].sort();
    }

    /// All fields known to be equal to `field`, including `field` itself.
    pub fn equivalents<'a>(&'a self, field: &'a FieldRef) -> impl Iterator<Item = &'a FieldRef> {
        match self.class_of.get(field) {
            Some(&idx) => Either::Left(self.classes[idx].iter()),
            None => Either::Right(std::iter::once(field)),
        }
    }

    pub fn iter_classes(&self) -> impl Iterator<Item = &[FieldRef]> {
        self.classes
            .iter()
            .filter(|class| !class.is_empty())
            .map(|class| class.as_slice())
    }
}

impl fmt::Display for EqualitySets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.iter_classes()
                .map(|class| format!("({})", class.iter().join(" = ")))
                .join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(table: usize, column: usize) -> FieldRef {
        FieldRef::new(table, column, format!("t{}.c{}", table, column))
    }

    #[test]
    fn merge_classes() {
        let mut sets = EqualitySets::new();
        sets.add_equal([field(0, 0), field(1, 0)]);
        sets.add_equal([field(2, 1), field(3, 1)]);
        assert!(!sets.equivalents(&field(0, 0)).any(|f| *f == field(3, 1)));

        sets.add_equal([field(1, 0), field(3, 1)]);
        assert!(sets.equivalents(&field(0, 0)).any(|f| *f == field(3, 1)));
        assert_eq!(
            sets.equivalents(&field(2, 1)).cloned().collect::<Vec<_>>(),
            vec![field(0, 0), field(1, 0), field(2, 1), field(3, 1)]
        );
        assert_eq!(sets.iter_classes().count(), 1);
        assert_eq!(sets.to_string(), "(t0.c0 = t1.c0 = t2.c1 = t3.c1)");
    }

    #[test]
    fn unknown_field_is_its_own_class() {
        let sets = EqualitySets::new();
        let f = field(4, 2);
        assert_eq!(sets.equivalents(&f).collect::<Vec<_>>(), vec![&f]);
    }
}
