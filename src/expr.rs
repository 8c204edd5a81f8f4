use crate::parse::{self, ParseContext, ParseError};
use crate::table_map::{TableMap, TableNo};
use auto_enums::auto_enum;
use itertools::Itertools;
use sqlparser::ast;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use traversal::DftPre;

/// A column of one table in the plan. Two refs are equal when they point at the same column of
/// the same plan table, the name is only kept for display.
#[derive(Clone, Debug)]
pub struct FieldRef {
    pub table: TableNo,
    pub column: usize,
    name: Arc<str>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Long(i64),
    Double(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DataType {
    Int,
    Double,
    Str,
    Bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Field(FieldRef),
    Value(Value),
    /// Statement parameter, supplied when the statement is executed.
    Param(usize),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    BinaryOp {
        left: Box<Expr>,
        right: Box<Expr>,
        op: BinaryOperator,
    },
    UnaryOp {
        expr: Box<Expr>,
        op: UnaryOperator,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BinaryOperator {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Gt,
    Lt,
    GtEq,
    LtEq,
    Eq,
    NotEq,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum UnaryOperator {
    Minus,
    Not,
}

macro_rules! convert_binary_op {
    ($expr:expr, ($($op:ident),*)) => {
        match $expr {
            $(
                ast::BinaryOperator::$op => Ok(BinaryOperator::$op)
            ),*,
            _ => Err(ParseError::Expr(format!("Unexpected op {}", $expr))),
        }
    };
}

impl FieldRef {
    pub fn new(table: TableNo, column: usize, name: impl Into<Arc<str>>) -> Self {
        Self {
            table,
            column,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for FieldRef {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.column == other.column
    }
}

impl Eq for FieldRef {}

impl Hash for FieldRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.column.hash(state);
    }
}

impl PartialOrd for FieldRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldRef {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.table, self.column).cmp(&(other.table, other.column))
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn to_double(&self) -> Option<f64> {
        match self {
            Value::Long(val) => Some(*val as f64),
            Value::Double(val) => Some(*val),
            _ => None,
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Long(_) => Some(DataType::Int),
            Value::Double(_) => Some(DataType::Double),
            Value::Str(_) => Some(DataType::Str),
            Value::Bool(_) => Some(DataType::Bool),
        }
    }
}

impl DataType {
    /// Whether a constant can be bound to a column of this type without a lossy conversion.
    pub fn accepts(&self, val: &Value) -> bool {
        matches!(
            (self, val),
            (DataType::Int, Value::Long(_))
                | (DataType::Double, Value::Long(_) | Value::Double(_))
                | (DataType::Str, Value::Str(_))
                | (DataType::Bool, Value::Bool(_) | Value::Long(0 | 1))
        )
    }

    /// Maps a SQL type name to the coarse type used for key compatibility checks.
    pub fn from_sql_name(name: &str) -> Self {
        let name = name.to_lowercase();
        match name.as_str() {
            _ if name.starts_with("bool") => DataType::Bool,
            _ if name.contains("int") => DataType::Int,
            _ if name.starts_with("double")
                || name.starts_with("float")
                || name.starts_with("real")
                || name.starts_with("dec")
                || name.starts_with("numeric") =>
            {
                DataType::Double
            }
            _ => DataType::Str,
        }
    }
}

impl Expr {
    pub fn new(ast_expr: &ast::Expr, context: &ParseContext) -> parse::Result<Self> {
        match ast_expr {
            ast::Expr::Identifier(ast::Ident { value, .. }) => context
                .find_field(value, None)
                .map(Expr::Field)
                .ok_or_else(|| ParseError::NoColumn(value.clone())),
            ast::Expr::CompoundIdentifier(idents) => {
                if idents.len() != 2 {
                    return Err(ParseError::Expr(format!(
                        "Expected <table>.<column>, got {}",
                        ast_expr
                    )));
                }
                context
                    .find_field(&idents[1].value, Some(&idents[0].value))
                    .map(Expr::Field)
                    .ok_or_else(|| {
                        ParseError::NoColumn(format!("{}.{}", idents[0].value, idents[1].value))
                    })
            }
            ast::Expr::Value(val) => match val {
                ast::Value::Number(val, _) => val
                    .parse::<i64>()
                    .map(|val| Expr::Value(Value::Long(val)))
                    .or_else(|_| val.parse::<f64>().map(|val| Expr::Value(Value::Double(val))))
                    .map_err(|_| ParseError::Expr(format!("Could not parse value: {}", val))),
                ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
                    Ok(Expr::Value(Value::Str(s.clone())))
                }
                ast::Value::Boolean(b) => Ok(Expr::Value(Value::Bool(*b))),
                ast::Value::Null => Ok(Expr::Value(Value::Null)),
                ast::Value::Placeholder(s) => {
                    if s == "?" {
                        Ok(Expr::Param(context.next_param()))
                    } else {
                        // Explicitly numbered placeholders ($1, ?1) count from one.
                        s[1..]
                            .parse::<usize>()
                            .ok()
                            .filter(|&num| num > 0)
                            .map(|num| Expr::Param(num - 1))
                            .ok_or_else(|| ParseError::Expr(format!("Bad placeholder {}", s)))
                    }
                }
                _ => Err(ParseError::Expr(format!("Unsupported value {}", val))),
            },
            ast::Expr::BinaryOp { left, right, op } => {
                let left = Box::new(Expr::new(left, context)?);
                let right = Box::new(Expr::new(right, context)?);
                let op = convert_binary_op!(
                    op,
                    (Plus, Minus, Multiply, Divide, Modulo, Gt, Lt, GtEq, LtEq, Eq, NotEq, And, Or)
                )?;
                Ok(Expr::BinaryOp { left, right, op })
            }
            ast::Expr::UnaryOp { expr, op } => {
                let expr = Expr::new(expr, context)?;
                let op = match op {
                    ast::UnaryOperator::Plus => {
                        return Ok(expr);
                    }
                    ast::UnaryOperator::Minus => UnaryOperator::Minus,
                    ast::UnaryOperator::Not => UnaryOperator::Not,
                    _ => {
                        return Err(ParseError::Expr(format!("Unsupported operator {}", op)));
                    }
                };
                Ok(Expr::UnaryOp {
                    expr: Box::new(expr),
                    op,
                })
            }
            ast::Expr::Nested(expr) => Expr::new(expr, context),
            ast::Expr::Function(ast::Function { name, args, .. }) => {
                let name = name.to_string().to_lowercase();
                let args = args
                    .iter()
                    .map(|arg| {
                        if let ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(arg)) = arg {
                            Expr::new(arg, context)
                        } else {
                            Err(ParseError::Expr(format!(
                                "Do not support named or wildcard function arguments: {}",
                                arg
                            )))
                        }
                    })
                    .collect::<parse::Result<_>>()?;
                Ok(Expr::Function { name, args })
            }
            ast::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => Ok(Expr::Between {
                expr: Box::new(Expr::new(expr, context)?),
                low: Box::new(Expr::new(low, context)?),
                high: Box::new(Expr::new(high, context)?),
                negated: *negated,
            }),
            ast::Expr::IsNull(expr) => Ok(Expr::IsNull {
                expr: Box::new(Expr::new(expr, context)?),
                negated: false,
            }),
            ast::Expr::IsNotNull(expr) => Ok(Expr::IsNull {
                expr: Box::new(Expr::new(expr, context)?),
                negated: true,
            }),
            ast::Expr::Like {
                negated,
                expr,
                pattern,
                escape_char,
            } => {
                if escape_char.is_some() {
                    return Err(ParseError::Expr(
                        "Do not support LIKE with an escape char".to_string(),
                    ));
                }
                let expr = Box::new(Expr::new(expr, context)?);
                match Expr::new(pattern, context)? {
                    Expr::Value(Value::Str(pattern)) => Ok(Expr::Like {
                        expr,
                        pattern,
                        negated: *negated,
                    }),
                    pattern => Err(ParseError::Expr(format!("Unexpected pattern {}", pattern))),
                }
            }
            ast::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let expr = Box::new(Expr::new(expr, context)?);
                let list = list
                    .iter()
                    .map(|expr| Expr::new(expr, context))
                    .collect::<parse::Result<_>>()?;
                Ok(Expr::InList {
                    expr,
                    list,
                    negated: *negated,
                })
            }
            _ => Err(ParseError::Expr(format!(
                "Expression not supported: {}",
                ast_expr
            ))),
        }
    }

    pub fn new_and(exprs: Vec<Expr>) -> Option<Expr> {
        exprs.into_iter().reduce(|left, right| Expr::BinaryOp {
            left: Box::new(left),
            right: Box::new(right),
            op: BinaryOperator::And,
        })
    }

    /// Splits nested top-level ANDs into their operands.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::BinaryOp {
                left,
                right,
                op: BinaryOperator::And,
            } => {
                let mut out = left.conjuncts();
                out.extend(right.conjuncts());
                out
            }
            _ => vec![self],
        }
    }

    #[auto_enum(Iterator)]
    pub fn iter_children(&self) -> impl Iterator<Item = &Expr> {
        match self {
            Expr::Field(_) | Expr::Value(_) | Expr::Param(_) => std::iter::empty(),
            Expr::BinaryOp { left, right, .. } => vec![left.as_ref(), right.as_ref()].into_iter(),
            Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } | Expr::Like { expr, .. } => {
                std::iter::once(expr.as_ref())
            }
            Expr::Function { args, .. } => args.iter(),
            Expr::Between { expr, low, high, .. } => {
                vec![expr.as_ref(), low.as_ref(), high.as_ref()].into_iter()
            }
            Expr::InList { expr, list, .. } => std::iter::once(expr.as_ref()).chain(list.iter()),
        }
    }

    /// Iterates over the expression tree in dft order.
    pub fn iter_tree(&self) -> impl Iterator<Item = &Expr> {
        DftPre::new(self, |expr| expr.iter_children()).map(|(_, expr)| expr)
    }

    /// Iterates over all fields referred to by this expression.
    pub fn fields(&self) -> impl Iterator<Item = &FieldRef> {
        self.iter_tree().filter_map(|expr| match expr {
            Expr::Field(field) => Some(field),
            _ => None,
        })
    }

    pub fn tables(&self) -> TableMap {
        self.fields().map(|field| field.table).collect()
    }

    pub fn as_field(&self) -> Option<&FieldRef> {
        match self {
            Expr::Field(field) => Some(field),
            _ => None,
        }
    }

    /// True if the expression does not depend on any table.
    pub fn is_const(&self) -> bool {
        self.fields().next().is_none()
    }

    /// Folds literal arithmetic. Returns `None` for anything which needs a runtime value,
    /// including statement parameters and function calls.
    pub fn const_value(&self) -> Option<Value> {
        match self {
            Expr::Value(val) => Some(val.clone()),
            Expr::UnaryOp {
                expr,
                op: UnaryOperator::Minus,
            } => match expr.const_value()? {
                Value::Long(val) => val.checked_neg().map(Value::Long),
                Value::Double(val) => Some(Value::Double(-val)),
                _ => None,
            },
            Expr::BinaryOp { left, right, op } => {
                match (left.const_value()?, right.const_value()?) {
                    (Value::Long(left), Value::Long(right)) => match op {
                        BinaryOperator::Plus => left.checked_add(right),
                        BinaryOperator::Minus => left.checked_sub(right),
                        BinaryOperator::Multiply => left.checked_mul(right),
                        BinaryOperator::Divide => left.checked_div(right),
                        BinaryOperator::Modulo => left.checked_rem(right),
                        _ => None,
                    }
                    .map(Value::Long),
                    (left, right) => {
                        let (left, right) = (left.to_double()?, right.to_double()?);
                        match op {
                            BinaryOperator::Plus => Some(left + right),
                            BinaryOperator::Minus => Some(left - right),
                            BinaryOperator::Multiply => Some(left * right),
                            BinaryOperator::Divide if right != 0. => Some(left / right),
                            _ => None,
                        }
                        .map(Value::Double)
                    }
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Long(val) => write!(f, "{}", val),
            Value::Double(val) => write!(f, "{}", val),
            Value::Str(val) => write!(f, "'{}'", val),
            Value::Bool(val) => write!(f, "{}", val),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let not = |negated: bool| if negated { "NOT " } else { "" };
        match self {
            Expr::Field(field) => write!(f, "{}", field),
            Expr::Value(val) => write!(f, "{}", val),
            Expr::Param(num) => write!(f, "?{}", num),
            Expr::BinaryOp { left, right, op } => {
                let op_str = match op {
                    BinaryOperator::Plus => "+",
                    BinaryOperator::Minus => "-",
                    BinaryOperator::Multiply => "*",
                    BinaryOperator::Divide => "/",
                    BinaryOperator::Modulo => "%",
                    BinaryOperator::Gt => ">",
                    BinaryOperator::Lt => "<",
                    BinaryOperator::GtEq => ">=",
                    BinaryOperator::LtEq => "<=",
                    BinaryOperator::Eq => "=",
                    BinaryOperator::NotEq => "!=",
                    BinaryOperator::And => "AND",
                    BinaryOperator::Or => "OR",
                };
                if let BinaryOperator::And | BinaryOperator::Or = op {
                    write!(f, "({} {} {})", left, op_str, right)
                } else {
                    write!(f, "{} {} {}", left, op_str, right)
                }
            }
            Expr::UnaryOp { expr, op } => match op {
                UnaryOperator::Minus => write!(f, "-{}", expr),
                UnaryOperator::Not => write!(f, "NOT {}", expr),
            },
            Expr::IsNull { expr, negated } => write!(f, "{} IS {}NULL", expr, not(*negated)),
            Expr::Function { name, args } => write!(f, "{}({})", name, args.iter().join(", ")),
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(f, "{} {}BETWEEN {} AND {}", expr, not(*negated), low, high),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => write!(f, "{} {}LIKE '{}'", expr, not(*negated), pattern),
            Expr::InList {
                expr,
                list,
                negated,
            } => write!(f, "{} {}IN ({})", expr, not(*negated), list.iter().join(", ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(table: TableNo, column: usize, name: &str) -> Expr {
        Expr::Field(FieldRef::new(table, column, name))
    }

    fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            right: Box::new(right),
            op,
        }
    }

    #[test]
    fn field_identity_ignores_name() {
        assert_eq!(FieldRef::new(1, 2, "a.x"), FieldRef::new(1, 2, "alias.x"));
        assert!(FieldRef::new(1, 2, "a.x") < FieldRef::new(2, 0, "b.y"));
    }

    #[test]
    fn tables_and_fields() {
        let expr = binary(
            binary(field(0, 1, "t1.a"), BinaryOperator::Eq, field(2, 0, "t3.b")),
            BinaryOperator::And,
            Expr::IsNull {
                expr: Box::new(field(2, 1, "t3.c")),
                negated: true,
            },
        );
        assert_eq!(expr.tables().iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(
            expr.fields().map(|field| field.name()).collect::<Vec<_>>(),
            vec!["t1.a", "t3.b", "t3.c"]
        );
        assert_eq!(expr.conjuncts().len(), 2);
        assert_eq!(
            expr.to_string(),
            "(t1.a = t3.b AND t3.c IS NOT NULL)"
        );
        assert!(!expr.is_const());
    }

    #[test]
    fn const_folding() {
        let expr = binary(
            Expr::Value(Value::Long(3)),
            BinaryOperator::Multiply,
            Expr::UnaryOp {
                expr: Box::new(Expr::Value(Value::Long(2))),
                op: UnaryOperator::Minus,
            },
        );
        assert!(expr.is_const());
        assert_eq!(expr.const_value(), Some(Value::Long(-6)));

        let expr = binary(
            Expr::Value(Value::Long(1)),
            BinaryOperator::Plus,
            Expr::Value(Value::Double(0.5)),
        );
        assert_eq!(expr.const_value(), Some(Value::Double(1.5)));
        assert_eq!(Expr::Param(0).const_value(), None);
        assert_eq!(
            Expr::Function {
                name: "now".to_string(),
                args: vec![]
            }
            .const_value(),
            None
        );
    }

    #[test]
    fn data_type_compat() {
        assert!(DataType::Int.accepts(&Value::Long(1)));
        assert!(!DataType::Int.accepts(&Value::Str("1".to_string())));
        assert!(DataType::Double.accepts(&Value::Long(1)));
        assert!(!DataType::Str.accepts(&Value::Null));
        assert_eq!(DataType::from_sql_name("BIGINT"), DataType::Int);
        assert_eq!(DataType::from_sql_name("varchar(20)"), DataType::Str);
        assert_eq!(DataType::from_sql_name("DECIMAL(10,2)"), DataType::Double);
    }
}
