use crate::db::inspector::SchemaSnapshot;
use crate::error::RejectReason;
use regex::Regex;
use sqlparser::ast::{
    Cte, Distinct, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Join, JoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Outcome of validating one candidate statement. Produced fresh per
/// candidate; rejections never reach the executor.
#[derive(Debug, Clone)]
pub enum ValidationVerdict {
    Accepted { normalized: String },
    Rejected { reason: RejectReason, detail: String },
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted { .. })
    }
}

/// Schema namespaces and prefixes the generated SQL must never touch.
const SYSTEM_SCHEMAS: &[&str] = &["information_schema", "pg_catalog", "system", "temp"];
const SYSTEM_TABLE_PREFIXES: &[&str] = &["pg_", "sqlite_", "duckdb_"];

/// Enforces the read-only, schema-conformant safety policy. Rules in order,
/// first violation wins: single read-only query, known identifiers only, no
/// system catalog references.
pub fn validate(candidate: &str, schema: &SchemaSnapshot) -> ValidationVerdict {
    let statements = match Parser::parse_sql(&GenericDialect {}, candidate) {
        Ok(statements) => statements,
        Err(e) => {
            return ValidationVerdict::Rejected {
                reason: RejectReason::UnsafeOperation,
                detail: format!("statement does not parse as a single query: {}", e),
            }
        }
    };

    if statements.len() != 1 {
        return ValidationVerdict::Rejected {
            reason: RejectReason::UnsafeOperation,
            detail: format!("expected one statement, found {}", statements.len()),
        };
    }

    let query = match &statements[0] {
        Statement::Query(query) => query,
        other => {
            return ValidationVerdict::Rejected {
                reason: RejectReason::UnsafeOperation,
                detail: format!("not a read-only query: {}", statement_kind(other)),
            }
        }
    };

    let mut walker = Walker::default();
    if let Err(rejection) = walker.walk_query(query) {
        debug!("Candidate rejected during walk: {}", rejection.detail);
        return ValidationVerdict::Rejected {
            reason: rejection.reason,
            detail: rejection.detail,
        };
    }

    if let Err(rejection) = walker.resolve(schema) {
        debug!("Candidate rejected during resolution: {}", rejection.detail);
        return ValidationVerdict::Rejected {
            reason: rejection.reason,
            detail: rejection.detail,
        };
    }

    ValidationVerdict::Accepted {
        normalized: normalize(candidate),
    }
}

fn normalize(candidate: &str) -> String {
    let collapsed = Regex::new(r"\s+")
        .map(|re| re.replace_all(candidate.trim(), " ").into_owned())
        .unwrap_or_else(|_| candidate.trim().to_string());
    collapsed.trim_end_matches(';').trim().to_string()
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::Drop { .. } => "DROP",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::Truncate { .. } => "TRUNCATE",
        _ => "non-query statement",
    }
}

struct Rejection {
    reason: RejectReason,
    detail: String,
}

impl Rejection {
    fn unsafe_op(detail: impl Into<String>) -> Self {
        Self {
            reason: RejectReason::UnsafeOperation,
            detail: detail.into(),
        }
    }

    fn unknown(detail: impl Into<String>) -> Self {
        Self {
            reason: RejectReason::UnknownIdentifier,
            detail: detail.into(),
        }
    }

    fn out_of_scope(detail: impl Into<String>) -> Self {
        Self {
            reason: RejectReason::OutOfScopeReference,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct TableRef {
    name: String,
    alias: Option<String>,
    virtual_relation: bool,
}

#[derive(Debug, Clone)]
struct ColumnRef {
    qualifier: Option<String>,
    name: String,
}

/// Collects every table and column reference in a query, rejecting unsafe
/// constructs on the way.
#[derive(Default)]
struct Walker {
    tables: Vec<TableRef>,
    ctes: HashSet<String>,
    columns: Vec<ColumnRef>,
    output_aliases: HashSet<String>,
}

impl Walker {
    fn walk_query(&mut self, query: &Query) -> Result<(), Rejection> {
        if let Some(with) = &query.with {
            // Register CTE names first; their bodies may reference each other.
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
            for cte in &with.cte_tables {
                self.walk_cte(cte)?;
            }
        }

        self.walk_set_expr(&query.body)?;

        for order_by in &query.order_by {
            self.walk_expr(&order_by.expr)?;
        }
        if let Some(limit) = &query.limit {
            self.walk_expr(limit)?;
        }
        if let Some(offset) = &query.offset {
            self.walk_expr(&offset.value)?;
        }
        Ok(())
    }

    fn walk_cte(&mut self, cte: &Cte) -> Result<(), Rejection> {
        self.walk_query(&cte.query)
    }

    fn walk_set_expr(&mut self, set_expr: &SetExpr) -> Result<(), Rejection> {
        match set_expr {
            SetExpr::Select(select) => self.walk_select(select),
            SetExpr::Query(query) => self.walk_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.walk_set_expr(left)?;
                self.walk_set_expr(right)
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for expr in row {
                        self.walk_expr(expr)?;
                    }
                }
                Ok(())
            }
            SetExpr::Insert(_) | SetExpr::Update(_) => {
                Err(Rejection::unsafe_op("data modification inside query body"))
            }
            SetExpr::Table(_) => Ok(()),
        }
    }

    fn walk_select(&mut self, select: &Select) -> Result<(), Rejection> {
        if select.into.is_some() {
            return Err(Rejection::unsafe_op("SELECT INTO writes a table"));
        }

        for table_with_joins in &select.from {
            self.walk_table_with_joins(table_with_joins)?;
        }

        if let Some(Distinct::On(exprs)) = &select.distinct {
            for expr in exprs {
                self.walk_expr(expr)?;
            }
        }

        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => self.walk_expr(expr)?,
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.output_aliases.insert(alias.value.to_lowercase());
                    self.walk_expr(expr)?;
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    self.columns.push(ColumnRef {
                        qualifier: object_name_tail(name),
                        name: "*".to_string(),
                    });
                }
                SelectItem::Wildcard(_) => {}
            }
        }

        if let Some(selection) = &select.selection {
            self.walk_expr(selection)?;
        }
        match &select.group_by {
            GroupByExpr::Expressions(exprs) => {
                for expr in exprs {
                    self.walk_expr(expr)?;
                }
            }
            GroupByExpr::All => {}
        }
        for expr in &select.sort_by {
            self.walk_expr(expr)?;
        }
        if let Some(having) = &select.having {
            self.walk_expr(having)?;
        }
        Ok(())
    }

    fn walk_table_with_joins(&mut self, twj: &TableWithJoins) -> Result<(), Rejection> {
        self.walk_table_factor(&twj.relation)?;
        for join in &twj.joins {
            self.walk_join(join)?;
        }
        Ok(())
    }

    fn walk_join(&mut self, join: &Join) -> Result<(), Rejection> {
        self.walk_table_factor(&join.relation)?;
        let constraint = match &join.join_operator {
            JoinOperator::Inner(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c)
            | JoinOperator::LeftSemi(c)
            | JoinOperator::RightSemi(c)
            | JoinOperator::LeftAnti(c)
            | JoinOperator::RightAnti(c) => Some(c),
            _ => None,
        };
        if let Some(constraint) = constraint {
            match constraint {
                JoinConstraint::On(expr) => self.walk_expr(expr)?,
                JoinConstraint::Using(columns) => {
                    for column in columns {
                        self.columns.push(ColumnRef {
                            qualifier: None,
                            name: column.value.to_lowercase(),
                        });
                    }
                }
                JoinConstraint::Natural | JoinConstraint::None => {}
            }
        }
        Ok(())
    }

    fn walk_table_factor(&mut self, factor: &TableFactor) -> Result<(), Rejection> {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if args.is_some() {
                    return Err(Rejection::out_of_scope(format!(
                        "table function '{}' is outside the declared schema",
                        name
                    )));
                }
                check_object_name(name)?;
                let table = object_name_tail(name)
                    .ok_or_else(|| Rejection::unknown("empty table name"))?;
                let virtual_relation = self.ctes.contains(&table);
                self.tables.push(TableRef {
                    name: table,
                    alias: alias.as_ref().map(|a| a.name.value.to_lowercase()),
                    virtual_relation,
                });
                Ok(())
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                self.walk_query(subquery)?;
                if let Some(alias) = alias {
                    self.tables.push(TableRef {
                        name: alias.name.value.to_lowercase(),
                        alias: None,
                        virtual_relation: true,
                    });
                }
                Ok(())
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.walk_table_with_joins(table_with_joins),
            other => Err(Rejection::out_of_scope(format!(
                "unsupported table expression: {}",
                other
            ))),
        }
    }

    fn walk_expr(&mut self, expr: &Expr) -> Result<(), Rejection> {
        match expr {
            Expr::Identifier(ident) => {
                self.columns.push(ColumnRef {
                    qualifier: None,
                    name: ident.value.to_lowercase(),
                });
            }
            Expr::CompoundIdentifier(parts) => {
                if let [qualifier @ .., column] = parts.as_slice() {
                    let qualifier = qualifier
                        .last()
                        .map(|q| q.value.to_lowercase())
                        .unwrap_or_default();
                    self.columns.push(ColumnRef {
                        qualifier: Some(qualifier),
                        name: column.value.to_lowercase(),
                    });
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                self.walk_expr(left)?;
                self.walk_expr(right)?;
            }
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::IsTrue(expr)
            | Expr::IsNotTrue(expr)
            | Expr::IsFalse(expr)
            | Expr::IsNotFalse(expr)
            | Expr::IsUnknown(expr)
            | Expr::IsNotUnknown(expr) => {
                self.walk_expr(expr)?;
            }
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.walk_expr(left)?;
                self.walk_expr(right)?;
            }
            Expr::Cast { expr, .. } | Expr::TryCast { expr, .. } => {
                self.walk_expr(expr)?;
            }
            Expr::Extract { expr, .. }
            | Expr::Floor { expr, .. }
            | Expr::Ceil { expr, .. } => {
                self.walk_expr(expr)?;
            }
            Expr::Position { expr, r#in } => {
                self.walk_expr(expr)?;
                self.walk_expr(r#in)?;
            }
            Expr::Substring { expr, .. } | Expr::Trim { expr, .. } => {
                self.walk_expr(expr)?;
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.walk_expr(expr)?;
                self.walk_expr(pattern)?;
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.walk_expr(expr)?;
                self.walk_expr(low)?;
                self.walk_expr(high)?;
            }
            Expr::InList { expr, list, .. } => {
                self.walk_expr(expr)?;
                for item in list {
                    self.walk_expr(item)?;
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.walk_expr(expr)?;
                self.walk_query(subquery)?;
            }
            Expr::Subquery(query) => {
                self.walk_query(query)?;
            }
            Expr::Exists { subquery, .. } => {
                self.walk_query(subquery)?;
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.walk_expr(operand)?;
                }
                for condition in conditions {
                    self.walk_expr(condition)?;
                }
                for result in results {
                    self.walk_expr(result)?;
                }
                if let Some(else_result) = else_result {
                    self.walk_expr(else_result)?;
                }
            }
            Expr::Function(function) => {
                for arg in &function.args {
                    match arg {
                        FunctionArg::Named { arg, .. } | FunctionArg::Unnamed(arg) => match arg {
                            FunctionArgExpr::Expr(expr) => self.walk_expr(expr)?,
                            FunctionArgExpr::QualifiedWildcard(name) => {
                                self.columns.push(ColumnRef {
                                    qualifier: object_name_tail(name),
                                    name: "*".to_string(),
                                });
                            }
                            FunctionArgExpr::Wildcard => {}
                        },
                    }
                }
            }
            Expr::Tuple(exprs) => {
                for expr in exprs {
                    self.walk_expr(expr)?;
                }
            }
            // Literals, intervals and the long tail of dialect-specific
            // expressions carry no identifiers we need to check.
            _ => {}
        }
        Ok(())
    }

    /// Resolves collected references against the snapshot. Tables first,
    /// then columns through the alias map.
    fn resolve(&self, schema: &SchemaSnapshot) -> Result<(), Rejection> {
        let mut alias_map: HashMap<String, &TableRef> = HashMap::new();
        for table in &self.tables {
            alias_map.insert(table.name.clone(), table);
            if let Some(alias) = &table.alias {
                alias_map.insert(alias.clone(), table);
            }
        }

        for table in &self.tables {
            if table.virtual_relation {
                continue;
            }
            if schema.table(&table.name).is_none() {
                return Err(Rejection::unknown(format!(
                    "unknown table '{}'",
                    table.name
                )));
            }
        }

        let any_virtual = self.tables.iter().any(|t| t.virtual_relation);

        for column in &self.columns {
            match &column.qualifier {
                Some(qualifier) => {
                    let Some(table) = alias_map.get(qualifier) else {
                        if self.ctes.contains(qualifier) {
                            continue;
                        }
                        return Err(Rejection::unknown(format!(
                            "unknown table or alias '{}'",
                            qualifier
                        )));
                    };
                    if table.virtual_relation || column.name == "*" {
                        continue;
                    }
                    let known = schema
                        .table(&table.name)
                        .map(|t| t.column(&column.name).is_some())
                        .unwrap_or(false);
                    if !known {
                        return Err(Rejection::unknown(format!(
                            "unknown column '{}.{}'",
                            table.name, column.name
                        )));
                    }
                }
                None => {
                    if column.name == "*" || self.output_aliases.contains(&column.name) {
                        continue;
                    }
                    let known = self.tables.iter().any(|table| {
                        !table.virtual_relation
                            && schema
                                .table(&table.name)
                                .map(|t| t.column(&column.name).is_some())
                                .unwrap_or(false)
                    });
                    if !known && !any_virtual {
                        return Err(Rejection::unknown(format!(
                            "unknown column '{}'",
                            column.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn object_name_tail(name: &ObjectName) -> Option<String> {
    name.0.last().map(|ident| ident.value.to_lowercase())
}

fn check_object_name(name: &ObjectName) -> Result<(), Rejection> {
    let parts: Vec<String> = name.0.iter().map(|i| i.value.to_lowercase()).collect();
    if let Some(table) = parts.last() {
        if SYSTEM_TABLE_PREFIXES.iter().any(|p| table.starts_with(p)) {
            return Err(Rejection::out_of_scope(format!(
                "system table '{}' is outside the declared schema",
                table
            )));
        }
    }
    for qualifier in &parts[..parts.len().saturating_sub(1)] {
        if SYSTEM_SCHEMAS.contains(&qualifier.as_str()) {
            return Err(Rejection::out_of_scope(format!(
                "system schema '{}' is outside the declared schema",
                qualifier
            )));
        }
    }
    Ok(())
}
