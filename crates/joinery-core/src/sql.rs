//! Remote join generation.
//!
//! Mappers describe their join through the [`RemoteQueryBuilder`] collaborator
//! and never format SQL themselves. [`SqlQueryBuilder`] is the reference
//! builder: one table alias per chain position, structured join conditions
//! alongside the text, and `?` placeholders for every literal.

use crate::asof::AsOfAnalysis;
use crate::config::MapperConfig;
use crate::error::{MapperError, Result};
use crate::mapper::Mapper;
use crate::operation::Operation;
use crate::stack::MapperStack;
use joinery_model::{EntityName, Field, Schema, Value};
use std::collections::HashSet;
use std::fmt;

/// `alias.column`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

pub trait RemoteQueryBuilder {
    /// Column expression for `field` on the table joined at `position`.
    fn column(&mut self, field: &Field, position: &MapperStack) -> ColumnRef;

    fn emit_join_clause(&mut self, left: ColumnRef, right: ColumnRef, operator: &str);

    fn begin_group(&mut self);

    fn end_group(&mut self);

    fn push_join_context(&mut self, mapper: &Mapper);

    fn pop_join_context(&mut self);

    /// Has the join reaching `position` been emitted already?
    fn is_mapped_already(&self, position: &MapperStack) -> bool;

    fn mark_mapped(&mut self, position: &MapperStack);

    /// Emit a non-join predicate against the table at `position`.
    fn emit_filter(&mut self, op: &Operation, position: &MapperStack);

    /// Milestone clauses for as-of attributes pinned by the join at
    /// `position`.
    fn add_as_of_attribute_sql(&mut self, position: &MapperStack);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCondition {
    pub left: ColumnRef,
    pub right: ColumnRef,
    pub operator: String,
    /// Join-context depth at emission.
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableAlias {
    pub position: MapperStack,
    pub alias: String,
    pub entity: EntityName,
    pub table: String,
}

/// A rendered remote query. Rows are distinct, matching in-memory results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlQuery {
    select_alias: String,
    tables: Vec<TableAlias>,
    joins: Vec<JoinCondition>,
    where_clause: String,
    params: Vec<Value>,
}

impl SqlQuery {
    /// `select distinct t0.* from ...` for the objects `op` selects.
    pub fn for_operation(
        op: &Operation,
        schema: &Schema,
        config: &MapperConfig,
        analysis: Option<&AsOfAnalysis>,
    ) -> Result<SqlQuery> {
        let root_entity = op.result_entity().ok_or(MapperError::UnknownEntity)?;
        let root_meta = schema.entity(root_entity)?;
        let root = MapperStack::root();

        let mut builder = SqlQueryBuilder::new(schema, config, analysis);
        let select_alias = builder.alias_for(&root, root_entity, root_meta.table());
        builder.emit_filter(op, &root);
        Ok(builder.finish(select_alias))
    }

    /// Join of `mapper` alone, selecting the far side.
    pub fn for_mapper(mapper: &Mapper, schema: &Schema, config: &MapperConfig) -> Result<SqlQuery> {
        let near = schema.entity(mapper.near_entity())?;
        let far = schema.entity(mapper.far_entity())?;
        let root = MapperStack::root();

        let mut builder = SqlQueryBuilder::new(schema, config, None);
        builder.alias_for(&root, near.name(), near.table());
        mapper.generate_sql(&mut builder, &root);
        let select_alias = builder.alias_for(&mapper.far_position(&root), far.name(), far.table());
        Ok(builder.finish(select_alias))
    }

    pub fn sql(&self) -> String {
        let from = self
            .tables
            .iter()
            .map(|t| format!("{} {}", t.table, t.alias))
            .collect::<Vec<_>>()
            .join(", ");
        // Joins fan out; in-memory resolution yields each object once.
        let mut sql = format!("select distinct {}.* from {from}", self.select_alias);
        if !self.where_clause.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&self.where_clause);
        }
        sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn join_conditions(&self) -> &[JoinCondition] {
        &self.joins
    }

    pub fn tables(&self) -> &[TableAlias] {
        &self.tables
    }

    pub fn select_alias(&self) -> &str {
        &self.select_alias
    }

    pub fn entity_of(&self, alias: &str) -> Option<&EntityName> {
        self.tables
            .iter()
            .find(|t| t.alias == alias)
            .map(|t| &t.entity)
    }

    pub fn where_clause(&self) -> &str {
        &self.where_clause
    }
}

impl fmt::Display for SqlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

pub struct SqlQueryBuilder<'a> {
    schema: &'a Schema,
    analysis: Option<&'a AsOfAnalysis>,
    alias_prefix: String,
    tables: Vec<TableAlias>,
    joins: Vec<JoinCondition>,
    groups: Vec<Vec<String>>,
    params: Vec<Value>,
    context: Vec<Mapper>,
    mapped: HashSet<MapperStack>,
}

impl<'a> SqlQueryBuilder<'a> {
    pub fn new(schema: &'a Schema, config: &MapperConfig, analysis: Option<&'a AsOfAnalysis>) -> Self {
        Self {
            schema,
            analysis,
            alias_prefix: config.table_alias_prefix.clone(),
            tables: Vec::new(),
            joins: Vec::new(),
            groups: vec![Vec::new()],
            params: Vec::new(),
            context: Vec::new(),
            mapped: HashSet::new(),
        }
    }

    fn alias_for(&mut self, position: &MapperStack, entity: &EntityName, table: &str) -> String {
        if let Some(existing) = self
            .tables
            .iter()
            .find(|t| &t.position == position && &t.entity == entity)
        {
            return existing.alias.clone();
        }
        let alias = format!("{}{}", self.alias_prefix, self.tables.len());
        self.tables.push(TableAlias {
            position: position.clone(),
            alias: alias.clone(),
            entity: entity.clone(),
            table: table.to_string(),
        });
        alias
    }

    fn field_alias(&mut self, field: &Field, position: &MapperStack) -> String {
        let table = self
            .schema
            .get(field.owner())
            .map(|meta| meta.table().to_string())
            .unwrap_or_else(|| field.owner().as_str().to_ascii_uppercase());
        self.alias_for(position, field.owner(), &table)
    }

    fn push_condition(&mut self, condition: String) {
        if let Some(group) = self.groups.last_mut() {
            group.push(condition);
        }
    }

    fn bind(&mut self, value: &Value) -> &'static str {
        self.params.push(value.clone());
        "?"
    }

    pub fn finish(mut self, select_alias: String) -> SqlQuery {
        while self.groups.len() > 1 {
            self.end_group();
        }
        let where_clause = self.groups.pop().unwrap_or_default().join(" and ");
        SqlQuery {
            select_alias,
            tables: self.tables,
            joins: self.joins,
            where_clause,
            params: self.params,
        }
    }
}

impl RemoteQueryBuilder for SqlQueryBuilder<'_> {
    fn column(&mut self, field: &Field, position: &MapperStack) -> ColumnRef {
        ColumnRef {
            alias: self.field_alias(field, position),
            column: field.column().to_string(),
        }
    }

    fn emit_join_clause(&mut self, left: ColumnRef, right: ColumnRef, operator: &str) {
        self.push_condition(format!("{left} {operator} {right}"));
        self.joins.push(JoinCondition {
            left,
            right,
            operator: operator.to_string(),
            depth: self.context.len(),
        });
    }

    fn begin_group(&mut self) {
        self.groups.push(Vec::new());
    }

    fn end_group(&mut self) {
        if self.groups.len() < 2 {
            return;
        }
        let Some(group) = self.groups.pop() else {
            return;
        };
        match group.len() {
            0 => {}
            1 => self.push_condition(group.into_iter().collect()),
            _ => self.push_condition(format!("({})", group.join(" and "))),
        }
    }

    fn push_join_context(&mut self, mapper: &Mapper) {
        self.context.push(mapper.clone());
    }

    fn pop_join_context(&mut self) {
        self.context.pop();
    }

    fn is_mapped_already(&self, position: &MapperStack) -> bool {
        self.mapped.contains(position)
    }

    fn mark_mapped(&mut self, position: &MapperStack) {
        self.mapped.insert(position.clone());
    }

    fn emit_filter(&mut self, op: &Operation, position: &MapperStack) {
        match op {
            Operation::All(_) => {}
            Operation::None(_) => self.push_condition("1 = 0".to_string()),
            Operation::Eq(field, value) => {
                let column = self.column(field, position);
                let p = self.bind(value);
                self.push_condition(format!("{column} = {p}"));
            }
            Operation::In(field, values) => {
                let column = self.column(field, position);
                let placeholders: Vec<&str> = values.iter().map(|v| self.bind(v)).collect();
                self.push_condition(format!("{column} in ({})", placeholders.join(", ")));
            }
            Operation::Compare(field, op, value) => {
                let column = self.column(field, position);
                let p = self.bind(value);
                self.push_condition(format!("{column} {} {p}", op.sql()));
            }
            Operation::IsNull(field) => {
                let column = self.column(field, position);
                self.push_condition(format!("{column} is null"));
            }
            Operation::AsOfEq(field, date) => match field.milestone_columns() {
                Some((from, to)) => {
                    let alias = self.field_alias(field, position);
                    self.bind(date);
                    self.bind(date);
                    // A null `to` marks the current milestone.
                    self.push_condition(format!(
                        "{alias}.{from} <= ? and ({alias}.{to} is null or {alias}.{to} > ?)"
                    ));
                }
                None => {
                    let column = self.column(field, position);
                    let p = self.bind(date);
                    self.push_condition(format!("{column} = {p}"));
                }
            },
            Operation::And(ops) => {
                for op in ops {
                    self.emit_filter(op, position);
                }
            }
            Operation::Mapped(mapped) => {
                mapped.mapper().generate_sql(self, position);
                let far = mapped.mapper().far_position(position);
                self.emit_filter(mapped.underlying(), &far);
            }
        }
    }

    fn add_as_of_attribute_sql(&mut self, position: &MapperStack) {
        let Some(analysis) = self.analysis else {
            return;
        };
        for op in analysis.pinned_filters(position) {
            self.emit_filter(&op, position);
        }
    }
}
