use crate::expr::{BinaryOperator, Expr, UnaryOperator};
use crate::table_map::{TableMap, TableNo};

/// Result of pushing a table condition: the part the storage nodes evaluate and the part left
/// to the SQL layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CondSplit {
    pub pushed: Option<Expr>,
    pub remainder: Option<Expr>,
}

/// Translates table conditions into storage-node filters.
pub trait CondPushdown {
    /// Pushes as much of `cond` as possible as a filter on `tab_no`. Fields of tables in
    /// `allowed` may be referred to as parameters of the filter.
    fn push_cond(&self, cond: &Expr, tab_no: TableNo, allowed: TableMap) -> CondSplit;
}

/// Filter translator for the interpreted filter programs of the storage nodes. Comparisons of
/// columns against columns, literals and parameters can be translated, as can NULL checks,
/// ranges, IN lists and LIKE with a literal pattern. Function calls and arithmetic are left to
/// the SQL layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpretedCondPushdown;

impl CondPushdown for InterpretedCondPushdown {
    fn push_cond(&self, cond: &Expr, tab_no: TableNo, allowed: TableMap) -> CondSplit {
        let (pushed, remainder): (Vec<_>, Vec<_>) = cond
            .conjuncts()
            .into_iter()
            .partition(|conj| is_pushable_pred(conj, tab_no, allowed));
        CondSplit {
            pushed: Expr::new_and(pushed.into_iter().cloned().collect()),
            remainder: Expr::new_and(remainder.into_iter().cloned().collect()),
        }
    }
}

fn is_pushable_operand(expr: &Expr, tab_no: TableNo, allowed: TableMap) -> bool {
    match expr {
        Expr::Field(field) => field.table == tab_no || allowed.contain(field.table),
        Expr::Value(_) | Expr::Param(_) => true,
        Expr::UnaryOp {
            expr,
            op: UnaryOperator::Minus,
        } => matches!(expr.as_ref(), Expr::Value(_)),
        _ => false,
    }
}

fn is_own_field(expr: &Expr, tab_no: TableNo) -> bool {
    matches!(expr, Expr::Field(field) if field.table == tab_no)
}

fn is_pushable_pred(expr: &Expr, tab_no: TableNo, allowed: TableMap) -> bool {
    let operand = |expr: &Expr| is_pushable_operand(expr, tab_no, allowed);
    match expr {
        Expr::BinaryOp {
            left,
            right,
            op: BinaryOperator::And | BinaryOperator::Or,
        } => is_pushable_pred(left, tab_no, allowed) && is_pushable_pred(right, tab_no, allowed),
        Expr::BinaryOp {
            left,
            right,
            op:
                BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq,
        } => {
            // One side has to be a column of the filtered table.
            (is_own_field(left, tab_no) || is_own_field(right, tab_no))
                && operand(left)
                && operand(right)
        }
        Expr::UnaryOp {
            expr,
            op: UnaryOperator::Not,
        } => is_pushable_pred(expr, tab_no, allowed),
        Expr::IsNull { expr, .. } => is_own_field(expr, tab_no),
        Expr::Between {
            expr, low, high, ..
        } => is_own_field(expr, tab_no) && operand(low) && operand(high),
        Expr::InList { expr, list, .. } => {
            is_own_field(expr, tab_no) && list.iter().all(|item| operand(item))
        }
        Expr::Like { expr, .. } => is_own_field(expr, tab_no),
        Expr::Value(_) => true,
        Expr::Field(_)
        | Expr::Param(_)
        | Expr::BinaryOp { .. }
        | Expr::UnaryOp { .. }
        | Expr::Function { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{FieldRef, Value};
    use pretty_assertions::assert_eq;

    fn field(table: TableNo, name: &str) -> Expr {
        Expr::Field(FieldRef::new(table, 0, name))
    }

    fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            right: Box::new(right),
            op,
        }
    }

    #[test]
    fn split_conjuncts() {
        let cond = binary(
            binary(field(1, "t2.c"), BinaryOperator::Gt, Expr::Value(Value::Long(3))),
            BinaryOperator::And,
            Expr::Function {
                name: "f".to_string(),
                args: vec![field(1, "t2.d")],
            },
        );
        let split = InterpretedCondPushdown.push_cond(&cond, 1, TableMap::new());
        assert_eq!(split.pushed.map(|e| e.to_string()), Some("t2.c > 3".to_string()));
        assert_eq!(
            split.remainder.map(|e| e.to_string()),
            Some("f(t2.d)".to_string())
        );
    }

    #[test]
    fn other_tables_need_allowance() {
        let cond = binary(field(2, "t3.c"), BinaryOperator::Eq, field(0, "t1.x"));
        let split = InterpretedCondPushdown.push_cond(&cond, 2, TableMap::new());
        assert!(split.pushed.is_none());
        assert!(split.remainder.is_some());

        let split = InterpretedCondPushdown.push_cond(&cond, 2, TableMap::single(0));
        assert!(split.pushed.is_some());
        assert!(split.remainder.is_none());
    }

    #[test]
    fn arithmetic_not_pushed() {
        let cond = binary(
            binary(field(1, "t2.c"), BinaryOperator::Plus, Expr::Value(Value::Long(1))),
            BinaryOperator::Lt,
            Expr::Param(0),
        );
        let split = InterpretedCondPushdown.push_cond(&cond, 1, TableMap::new());
        assert_eq!(split, CondSplit {
            pushed: None,
            remainder: Some(cond),
        });
    }
}
