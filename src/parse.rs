use crate::access::{
    AccessType, ColumnDef, IndexDef, JoinNest, JoinNestKind, PlanError, QueryPlan, StorageEngine,
    TableAccess, TableDef,
};
use crate::equality::EqualitySets;
use crate::expr::{DataType, Expr, FieldRef};
use crate::utils;
use itertools::Itertools;
use log::debug;
use regex::Regex;
use rustc_hash::FxHashMap;
use sqlparser::ast;
use sqlparser::dialect::MySqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser as RawParser, ParserError as RawParseError};
use sqlparser::tokenizer::Token;
use std::cell::Cell;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Tables visible to expressions of a plan description.
pub struct ParseContext {
    tables: Vec<(String, Arc<TableDef>)>,
    next_param: Cell<usize>,
}

#[derive(Debug)]
pub enum ParseError {
    Raw(RawParseError),
    Io(io::Error),
    Statement(String),
    NoTable(String),
    NoColumn(String),
    Expr(String),
    Plan(PlanError),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Reads plan descriptions: table definitions, the access of each table in join order, join
/// nests and column equalities.
pub struct Parser {
    dialect: MySqlDialect,
}

/// An access statement before its expressions are resolved. Expressions may refer tables
/// accessed later in the plan.
struct RawAccess {
    table: Arc<TableDef>,
    alias: String,
    access_type: AccessType,
    index: Option<String>,
    keys: Vec<ast::Expr>,
    cond: Option<ast::Expr>,
    nest_cond: Option<ast::Expr>,
    rows: Option<f64>,
    select_no: Option<usize>,
    use_order: bool,
    reads_blobs: bool,
    for_update: bool,
}

enum PlanStmt {
    Access(Box<RawAccess>),
    Nest {
        kind: JoinNestKind,
        first: String,
        last: String,
    },
    Equal(Vec<ast::Expr>),
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    pub fn parse_file(&self, path: &Path) -> Result<QueryPlan> {
        let text = std::fs::read_to_string(path)?;
        self.parse(&text)
    }

    pub fn parse(&self, text: &str) -> Result<QueryPlan> {
        let mut table_defs = FxHashMap::default();
        let mut stmts = vec![];
        for sql in utils::split_statements(text) {
            let mut parser = RawParser::new(&self.dialect).try_with_sql(sql)?;
            let keyword = next_word(&mut parser)?.to_uppercase();
            match keyword.as_str() {
                "CREATE" => {
                    let table = self.parse_create(sql)?;
                    debug!("Table {} with {} columns", table.name, table.columns.len());
                    table_defs.insert(table.name.to_lowercase(), Arc::new(table));
                }
                "ACCESS" => stmts.push(PlanStmt::Access(Box::new(parse_access(
                    &mut parser,
                    &table_defs,
                )?))),
                "OUTER" | "SEMI" | "ANTI" => {
                    let kind = match keyword.as_str() {
                        "OUTER" => JoinNestKind::Outer,
                        "SEMI" => JoinNestKind::Semi,
                        _ => JoinNestKind::Anti,
                    };
                    let first = next_word(&mut parser)?;
                    parser.expect_keyword(Keyword::TO)?;
                    let last = next_word(&mut parser)?;
                    expect_end(&mut parser)?;
                    stmts.push(PlanStmt::Nest { kind, first, last });
                }
                "EQUAL" => {
                    let fields = parse_expr_list(&mut parser)?;
                    expect_end(&mut parser)?;
                    stmts.push(PlanStmt::Equal(fields));
                }
                _ => {
                    return Err(ParseError::Statement(format!(
                        "Unknown statement: {}",
                        sql
                    )))
                }
            }
        }
        build_plan(stmts)
    }

    fn parse_create(&self, sql: &str) -> Result<TableDef> {
        // Partitioning clauses are not understood by the sql parser, only their presence matters.
        let partition_re = Regex::new(r"(?is)\bPARTITION\s+BY\b.*$")
            .map_err(|err| ParseError::Statement(err.to_string()))?;
        let (sql, user_partitioned) = match partition_re.find(sql) {
            Some(clause) => (&sql[..clause.start()], true),
            None => (sql, false),
        };

        let stmts = RawParser::parse_sql(&self.dialect, sql)?;
        let stmt = match stmts.into_iter().exactly_one() {
            Ok(stmt) => stmt,
            Err(_) => return Err(ParseError::Statement(format!("Expected one statement: {}", sql))),
        };
        let (name, columns, constraints, engine) = match stmt {
            ast::Statement::CreateTable {
                name,
                columns,
                constraints,
                engine,
                ..
            } => (name, columns, constraints, engine),
            stmt => return Err(ParseError::Statement(format!("Not a table definition: {}", stmt))),
        };

        let name = name
            .0
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| ParseError::Statement(format!("Table without name: {}", sql)))?;
        let mut table = TableDef::new(
            name,
            columns
                .iter()
                .map(|col| ColumnDef {
                    name: col.name.value.clone(),
                    data_type: DataType::from_sql_name(&col.data_type.to_string()),
                    nullable: !col.options.iter().any(|opt| {
                        matches!(
                            opt.option,
                            ast::ColumnOption::NotNull
                                | ast::ColumnOption::Unique {
                                    is_primary: true
                                }
                        )
                    }),
                })
                .collect(),
        );
        if let Some(engine) = engine {
            table.engine = StorageEngine::from_name(&engine);
        }
        table.user_partitioned = user_partitioned;

        for (col_no, col) in columns.iter().enumerate() {
            for opt in &col.options {
                match opt.option {
                    ast::ColumnOption::Unique { is_primary: true } => {
                        table.primary_key = vec![col_no]
                    }
                    ast::ColumnOption::Unique { is_primary: false } => table.indexes.push(IndexDef {
                        name: col.name.value.clone(),
                        columns: vec![col_no],
                        unique: true,
                    }),
                    _ => {}
                }
            }
        }

        for constraint in &constraints {
            let (name, idents, unique, is_primary) = match constraint {
                ast::TableConstraint::Unique {
                    name,
                    columns,
                    is_primary,
                } => (name, columns, true, *is_primary),
                ast::TableConstraint::Index { name, columns, .. } => (name, columns, false, false),
                _ => {
                    return Err(ParseError::Statement(format!(
                        "Unsupported constraint on {}: {}",
                        table.name, constraint
                    )))
                }
            };
            let col_nos = idents
                .iter()
                .map(|ident| {
                    table
                        .find_column(&ident.value)
                        .ok_or_else(|| {
                            ParseError::NoColumn(format!("{}.{}", table.name, ident.value))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            if is_primary {
                for &col_no in &col_nos {
                    table.columns[col_no].nullable = false;
                }
                table.primary_key = col_nos;
            } else {
                let name = match name {
                    Some(name) => name.value.clone(),
                    None => format!(
                        "ix_{}",
                        col_nos.iter().map(|&col| &table.columns[col].name).join("_")
                    ),
                };
                table.indexes.push(IndexDef {
                    name,
                    columns: col_nos,
                    unique,
                });
            }
        }
        Ok(table)
    }
}

fn next_word(parser: &mut RawParser) -> Result<String> {
    match parser.next_token().token {
        Token::Word(word) => Ok(word.value),
        token => Err(ParseError::Statement(format!("Expected a name, found {}", token))),
    }
}

fn expect_end(parser: &mut RawParser) -> Result<()> {
    match parser.next_token().token {
        Token::EOF => Ok(()),
        token => Err(ParseError::Statement(format!("Unexpected {} at end of statement", token))),
    }
}

fn parse_expr_list(parser: &mut RawParser) -> Result<Vec<ast::Expr>> {
    parser.expect_token(&Token::LParen)?;
    let exprs = parser.parse_comma_separated(RawParser::parse_expr)?;
    parser.expect_token(&Token::RParen)?;
    Ok(exprs)
}

fn parse_number(parser: &mut RawParser) -> Result<f64> {
    match parser.next_token().token {
        Token::Number(num, _) => num
            .parse()
            .map_err(|_| ParseError::Statement(format!("Bad number {}", num))),
        token => Err(ParseError::Statement(format!("Expected a number, found {}", token))),
    }
}

fn parse_access(
    parser: &mut RawParser,
    table_defs: &FxHashMap<String, Arc<TableDef>>,
) -> Result<RawAccess> {
    let table_name = next_word(parser)?;
    let table = table_defs
        .get(&table_name.to_lowercase())
        .cloned()
        .ok_or_else(|| ParseError::NoTable(table_name.clone()))?;
    let alias = if parser.parse_keyword(Keyword::AS) {
        next_word(parser)?
    } else {
        table_name
    };
    let access_name = next_word(parser)?;
    let access_type = AccessType::from_str(&access_name.to_lowercase())
        .map_err(|_| ParseError::Statement(format!("Unknown access type {}", access_name)))?;

    let mut access = RawAccess {
        table,
        alias,
        access_type,
        index: None,
        keys: vec![],
        cond: None,
        nest_cond: None,
        rows: None,
        select_no: None,
        use_order: false,
        reads_blobs: false,
        for_update: false,
    };
    loop {
        let option = match parser.next_token().token {
            Token::EOF => break,
            Token::Word(word) => word.value.to_uppercase(),
            token => {
                return Err(ParseError::Statement(format!(
                    "Unexpected {} in access of {}",
                    token, access.alias
                )))
            }
        };
        match option.as_str() {
            "INDEX" => access.index = Some(next_word(parser)?),
            "KEY" => access.keys = parse_expr_list(parser)?,
            "COND" | "NEST_COND" => {
                parser.expect_token(&Token::LParen)?;
                let cond = parser.parse_expr()?;
                parser.expect_token(&Token::RParen)?;
                if option == "COND" {
                    access.cond = Some(cond);
                } else {
                    access.nest_cond = Some(cond);
                }
            }
            "ROWS" => access.rows = Some(parse_number(parser)?),
            "SELECT" => access.select_no = Some(parse_number(parser)? as usize),
            "ORDERED" => access.use_order = true,
            "BLOBS" => access.reads_blobs = true,
            "FOR_UPDATE" => access.for_update = true,
            _ => {
                return Err(ParseError::Statement(format!(
                    "Unknown access option {} of {}",
                    option, access.alias
                )))
            }
        }
    }
    Ok(access)
}

/// Resolves the statements of a plan description into a plan.
fn build_plan(stmts: Vec<PlanStmt>) -> Result<QueryPlan> {
    let context = ParseContext::new(
        stmts
            .iter()
            .filter_map(|stmt| match stmt {
                PlanStmt::Access(access) => Some((access.alias.clone(), access.table.clone())),
                _ => None,
            })
            .collect(),
    );

    let mut tables = vec![];
    let mut nests = vec![];
    let mut equalities = EqualitySets::new();
    for stmt in stmts {
        match stmt {
            PlanStmt::Access(access) => tables.push(resolve_access(*access, &context)?),
            PlanStmt::Nest { kind, first, last } => nests.push(JoinNest {
                kind,
                first: context.table_no(&first)?,
                last: context.table_no(&last)?,
            }),
            PlanStmt::Equal(exprs) => {
                let fields = exprs
                    .iter()
                    .map(|expr| match Expr::new(expr, &context)? {
                        Expr::Field(field) => Ok(field),
                        expr => Err(ParseError::Expr(format!(
                            "EQUAL expects fields, got {}",
                            expr
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                equalities.add_equal(fields);
            }
        }
    }
    QueryPlan::new(tables, nests, equalities).map_err(ParseError::Plan)
}

fn resolve_access(access: RawAccess, context: &ParseContext) -> Result<TableAccess> {
    let keys = access
        .keys
        .iter()
        .map(|key| Expr::new(key, context))
        .collect::<Result<Vec<_>>>()?;
    let mut table_access = TableAccess::new(access.alias, access.table.clone(), access.access_type)
        .with_keys(keys)
        .set_use_order(access.use_order)
        .set_reads_blobs(access.reads_blobs)
        .set_for_update(access.for_update);
    if let Some(index) = access.index {
        let index = access.table.find_index(&index).ok_or_else(|| {
            ParseError::Statement(format!("Table {} has no index {}", access.table.name, index))
        })?;
        table_access = table_access.with_index(index);
    }
    if let Some(cond) = access.cond {
        table_access = table_access.with_condition(Expr::new(&cond, context)?);
    }
    if let Some(cond) = access.nest_cond {
        table_access = table_access.with_nest_condition(Expr::new(&cond, context)?);
    }
    if let Some(rows) = access.rows {
        table_access = table_access.with_rows(rows);
    }
    if let Some(select_no) = access.select_no {
        table_access = table_access.with_select_no(select_no);
    }
    Ok(table_access)
}

impl ParseContext {
    pub fn new(tables: Vec<(String, Arc<TableDef>)>) -> Self {
        Self {
            tables,
            next_param: Cell::new(0),
        }
    }

    fn table_no(&self, alias: &str) -> Result<usize> {
        self.tables
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(alias))
            .ok_or_else(|| ParseError::NoTable(alias.to_string()))
    }

    /// Finds column `col_name` of the table with alias `alias`, or of the first table having
    /// such a column.
    pub fn find_field(&self, col_name: &str, alias: Option<&str>) -> Option<FieldRef> {
        self.tables
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| alias.map_or(true, |alias| name.eq_ignore_ascii_case(alias)))
            .find_map(|(tab_no, (name, table))| {
                table.find_column(col_name).map(|column| {
                    let col_name = &table.columns[column].name;
                    FieldRef::new(tab_no, column, format!("{}.{}", name, col_name))
                })
            })
    }

    /// Number of the next unnumbered `?` parameter.
    pub fn next_param(&self) -> usize {
        let num = self.next_param.get();
        self.next_param.set(num + 1);
        num
    }
}

impl From<RawParseError> for ParseError {
    fn from(err: RawParseError) -> Self {
        ParseError::Raw(err)
    }
}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> Self {
        ParseError::Io(err)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Raw(err) => write!(f, "{}", err),
            ParseError::Io(err) => write!(f, "could not read plan: {}", err),
            ParseError::Statement(msg) => write!(f, "{}", msg),
            ParseError::NoTable(name) => write!(f, "no table {}", name),
            ParseError::NoColumn(name) => write!(f, "no column {}", name),
            ParseError::Expr(msg) => write!(f, "bad expression: {}", msg),
            ParseError::Plan(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::Raw(err) => Some(err),
            ParseError::Io(err) => Some(err),
            ParseError::Plan(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::IndexUse;
    use crate::expr::Value;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn table_definitions() {
        let plan = Parser::new()
            .parse(
                "CREATE TABLE n (
                     id INT PRIMARY KEY,
                     a BIGINT NOT NULL,
                     b VARCHAR(20),
                     c DOUBLE,
                     CONSTRAINT uq_ab UNIQUE (a, b),
                     KEY ix_c (c)
                 ) ENGINE=ndbcluster;
                 CREATE TABLE i (x INT, y INT, PRIMARY KEY (x, y)) ENGINE=InnoDB;
                 CREATE TABLE p (x INT PRIMARY KEY) ENGINE=ndbcluster PARTITION BY KEY (x) PARTITIONS 4;
                 ACCESS n table_scan;
                 ACCESS i unique_key INDEX PRIMARY KEY (n.a, n.id);
                 ACCESS p primary_key INDEX PRIMARY KEY (n.id);",
            )
            .unwrap();

        let n = &plan.table(0).table;
        assert_eq!(n.engine, StorageEngine::Ndb);
        assert_eq!(n.primary_key, vec![0]);
        assert_eq!(
            n.columns.iter().map(|col| col.data_type).collect::<Vec<_>>(),
            vec![DataType::Int, DataType::Int, DataType::Str, DataType::Double]
        );
        assert!(!n.columns[1].nullable);
        assert!(n.columns[2].nullable);
        assert_eq!(n.find_index("uq_ab"), Some(IndexUse::Index(0)));
        assert!(n.is_unique(IndexUse::Index(0)));
        assert!(!n.is_unique(IndexUse::Index(1)));

        let i = &plan.table(1).table;
        assert_eq!(i.engine, StorageEngine::InnoDb);
        assert_eq!(i.primary_key, vec![0, 1]);
        assert!(!i.columns[1].nullable);

        assert!(plan.table(2).table.user_partitioned);
        assert!(!n.user_partitioned);
    }

    #[test]
    fn access_statements() {
        let plan = Parser::new()
            .parse(
                "CREATE TABLE t (pk INT PRIMARY KEY, a INT, KEY ix_a (a));
                 ACCESS t AS t1 ordered_index_scan INDEX ix_a KEY (?) ROWS 12.5 ORDERED;
                 ACCESS t AS t2 primary_key INDEX PRIMARY KEY (t3.a)
                     COND (t2.a BETWEEN 1 AND ? AND t2.pk <> -1) SELECT 2 BLOBS FOR_UPDATE;
                 ACCESS t AS t3 primary_key INDEX PRIMARY KEY (a) NEST_COND (t3.a IS NOT NULL);
                 OUTER t2 TO t3;
                 EQUAL (t1.a, t2.a, t3.pk);",
            )
            .unwrap();

        let t1 = plan.table(0);
        assert_eq!(t1.access_type, AccessType::OrderedIndexScan);
        assert_eq!(t1.index, Some(IndexUse::Index(0)));
        assert_eq!(t1.key_fields, vec![Expr::Param(0)]);
        assert_eq!(t1.rows, 12.5);
        assert!(t1.use_order);

        let t2 = plan.table(1);
        assert_eq!(t2.index, Some(IndexUse::Primary));
        assert_eq!(t2.key_fields[0].to_string(), "t3.a");
        assert_eq!(t2.key_fields[0].as_field().map(|field| field.table), Some(2));
        let params: Vec<_> = t2
            .condition
            .iter()
            .flat_map(|cond| cond.iter_tree())
            .filter(|expr| matches!(expr, Expr::Param(_)))
            .collect();
        assert_eq!(params, vec![&Expr::Param(1)]);
        assert_eq!(t2.select_no, 2);
        assert!(t2.reads_blobs && t2.for_update);

        // An unqualified column belongs to the first table having it.
        let t3 = plan.table(2);
        assert_eq!(t3.key_fields[0].as_field().map(|field| field.table), Some(0));
        assert!(t3.nest_condition.is_some());

        assert_eq!(plan.nests().len(), 1);
        assert_eq!((plan.nests()[0].first, plan.nests()[0].last), (1, 2));
        assert_eq!(t3.first_inner, 1);
        assert_eq!(plan.equalities().iter_classes().count(), 1);
        assert!(t2.condition.as_ref().map_or(false, |cond| cond
            .iter_tree()
            .any(|expr| expr == &Expr::Value(Value::Long(1)))));
    }

    #[test]
    fn parse_errors() {
        let parser = Parser::new();
        let create = "CREATE TABLE t (pk INT PRIMARY KEY, a INT);";
        assert!(matches!(
            parser.parse("ACCESS u table_scan;"),
            Err(ParseError::NoTable(_))
        ));
        assert!(matches!(
            parser.parse(&format!("{} ACCESS t index_merge;", create)),
            Err(ParseError::Statement(_))
        ));
        assert!(matches!(
            parser.parse(&format!("{} ACCESS t primary_key INDEX PRIMARY KEY (t.b);", create)),
            Err(ParseError::NoColumn(_))
        ));
        assert!(matches!(
            parser.parse(&format!("{} ACCESS t table_scan; OUTER t TO t;", create)),
            Err(ParseError::Plan(_))
        ));
        assert!(matches!(
            parser.parse(&format!("{} ACCESS t table_scan KEY (1", create)),
            Err(ParseError::Raw(_))
        ));
        assert!(matches!(
            parser.parse(&format!("{} ACCESS t table_scan; EQUAL (t.a, 1);", create)),
            Err(ParseError::Expr(_))
        ));
    }

    #[test]
    fn plan_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "-- two tables
             CREATE TABLE t (pk INT PRIMARY KEY, a INT);
             ACCESS t AS t0 table_scan;
             ACCESS t AS t1 primary_key INDEX PRIMARY KEY (t0.a);"
        )
        .unwrap();
        let plan = Parser::new().parse_file(file.path()).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.find_table("t1"), Some(1));
        assert!(Parser::new()
            .parse_file(&file.path().with_extension("missing"))
            .is_err());
    }
}
