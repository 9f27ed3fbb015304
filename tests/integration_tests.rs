//! Integration tests for the complete Joinery pipeline
//!
//! These tests drive the resolver across crates:
//! - model schema → mapper algebra → reference cache
//! - as-of checking → default injection → constant propagation
//! - in-memory resolution vs. remote SQL fallback
//!
//! Run with: cargo test --test integration_tests

use chrono::NaiveDate;
use joinery_cache::{CacheMode, IndexOptions, MemoryCache};
use joinery_core::{
    EqualityMapper, MapperConfig, MapperContext, MapperError, Operation, Resolution, Resolver,
    SqlQuery,
};
use joinery_model::{DomainObject, EntityBuilder, EntityName, ObjectRef, Schema, Value};
use tracing_subscriber::filter::LevelFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(LevelFilter::DEBUG)
        .try_init();
}

fn date(day: u32) -> Value {
    NaiveDate::from_ymd_opt(2024, 2, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(Value::from)
        .unwrap()
}

// ============================================================================
// Fixtures
// ============================================================================

fn schema(customer_default: Option<Value>) -> Schema {
    Schema::builder()
        .entity(
            EntityBuilder::new("Order")
                .table("ORDERS")
                .field("id", "ID")
                .field("customerId", "CUSTOMER_ID")
                .key(&["id"]),
        )
        .entity(
            EntityBuilder::new("Customer")
                .field("id", "ID")
                .field("name", "NAME")
                .as_of("businessDate", "FROM_Z", "THRU_Z", customer_default),
        )
        .build()
        .unwrap()
}

fn order(id: i64, customer: i64) -> ObjectRef {
    DomainObject::of("Order")
        .set("id", id)
        .set("customerId", customer)
        .build()
}

/// One milestone of a customer: valid from `from` until `thru` (open if None).
fn customer(id: i64, name: &str, from: u32, thru: Option<u32>) -> ObjectRef {
    DomainObject::of("Customer")
        .set("id", id)
        .set("name", name)
        .set("FROM_Z", date(from))
        .set("THRU_Z", thru.map(date))
        .build()
}

fn cache(schema: &Schema, customer_mode: CacheMode) -> MemoryCache {
    let cache = MemoryCache::new();
    let orders = EntityName::new("Order");
    let customers = EntityName::new("Customer");
    cache
        .register(schema.get(&orders).unwrap().clone(), CacheMode::Full)
        .unwrap();
    cache
        .register(schema.get(&customers).unwrap().clone(), customer_mode)
        .unwrap();
    cache
        .add_index(&orders, &["customerId"], IndexOptions::default())
        .unwrap();
    cache
        .insert_all(vec![order(1, 10), order(2, 20), order(3, 10)])
        .unwrap();
    if customer_mode == CacheMode::Full {
        cache
            .insert_all(vec![
                customer(10, "acme", 1, Some(5)),
                customer(10, "acme-renamed", 5, None),
                customer(20, "globex", 1, None),
            ])
            .unwrap();
    }
    cache
}

fn to_customer(schema: &Schema) -> EqualityMapper {
    EqualityMapper::new(
        schema.field("Order", "customerId").unwrap(),
        schema.field("Customer", "id").unwrap(),
    )
}

fn order_ids(resolution: &Resolution) -> Vec<Value> {
    let mut ids: Vec<Value> = resolution
        .objects()
        .unwrap()
        .iter()
        .map(|o| o.value("id").clone())
        .collect();
    ids.sort();
    ids
}

// ============================================================================
// In-memory resolution
// ============================================================================

#[test]
fn test_as_of_date_selects_the_matching_milestone() {
    init_tracing();
    let schema = schema(None);
    let cache = cache(&schema, CacheMode::Full);
    let config = MapperConfig::default();
    let ctx = MapperContext::new(&cache, &schema, &config);

    let name = schema.field("Customer", "name").unwrap();
    let business_date = schema.field("Customer", "businessDate").unwrap();
    let named_acme_on = |day| {
        Operation::mapped(
            to_customer(&schema),
            Operation::eq(&name, "acme").and(&Operation::as_of_eq(&business_date, date(day))),
        )
    };

    let before_rename = Resolver::new(ctx).resolve(&named_acme_on(3)).unwrap();
    assert_eq!(order_ids(&before_rename), vec![1.into(), 3.into()]);

    let after_rename = Resolver::new(ctx).resolve(&named_acme_on(7)).unwrap();
    assert_eq!(after_rename, Resolution::InMemory(Vec::new()));
}

#[test]
fn test_missing_date_uses_the_schema_default() {
    init_tracing();
    let config = MapperConfig::default();

    let strict = schema(None);
    let cache_strict = cache(&strict, CacheMode::Full);
    let name = strict.field("Customer", "name").unwrap();
    let op = Operation::mapped(to_customer(&strict), Operation::eq(&name, "acme-renamed"));
    let err = Resolver::new(MapperContext::new(&cache_strict, &strict, &config))
        .resolve(&op)
        .unwrap_err();
    assert!(matches!(err, MapperError::UnresolvableTemporalAttribute { .. }));

    let defaulted = schema(Some(date(9)));
    let cache_defaulted = cache(&defaulted, CacheMode::Full);
    let name = defaulted.field("Customer", "name").unwrap();
    let op = Operation::mapped(to_customer(&defaulted), Operation::eq(&name, "acme-renamed"));
    let resolution = Resolver::new(MapperContext::new(&cache_defaulted, &defaulted, &config))
        .resolve(&op)
        .unwrap();
    assert_eq!(order_ids(&resolution), vec![1.into(), 3.into()]);
}

// ============================================================================
// Remote fallback
// ============================================================================

#[test]
fn test_uncached_far_side_yields_propagated_sql() {
    init_tracing();
    let schema = schema(Some(date(9)));
    let cache = cache(&schema, CacheMode::Partial);
    let config = MapperConfig::from_json(r#"{ "table_alias_prefix": "j" }"#).unwrap();
    let ctx = MapperContext::new(&cache, &schema, &config);

    let customer_id = schema.field("Customer", "id").unwrap();
    let op = Operation::mapped(to_customer(&schema), Operation::eq(&customer_id, 10));
    let resolution = Resolver::new(ctx).resolve(&op).unwrap();

    let query = resolution.query().expect("partially cached customers go remote");
    assert_eq!(
        query.sql(),
        "select distinct j0.* from ORDERS j0, CUSTOMER j1 \
         where j0.CUSTOMER_ID = j1.ID and j1.FROM_Z <= ? and (j1.THRU_Z is null or j1.THRU_Z > ?) \
         and j1.ID = ? and j0.CUSTOMER_ID = ?"
    );
    assert_eq!(
        query.params(),
        &[date(9), date(9), Value::from(10), Value::from(10)]
    );
}

#[test]
fn test_ignored_as_of_attribute_is_not_defaulted() -> anyhow::Result<()> {
    init_tracing();
    let schema = schema(Some(date(9)));
    let cache = cache(&schema, CacheMode::Partial);
    let config = MapperConfig::default();
    let ctx = MapperContext::new(&cache, &schema, &config);

    let name = schema.field("Customer", "name")?;
    let business_date = schema.field("Customer", "businessDate")?;
    let op = Operation::mapped(to_customer(&schema), Operation::eq(&name, "acme"));
    let resolution = Resolver::new(ctx).ignoring_as_of([business_date]).resolve(&op)?;

    let query = resolution
        .query()
        .ok_or_else(|| anyhow::anyhow!("expected a remote query"))?;
    assert_eq!(
        query.sql(),
        "select distinct t0.* from ORDERS t0, CUSTOMER t1 where t0.CUSTOMER_ID = t1.ID and t1.NAME = ?"
    );
    Ok(())
}

// ============================================================================
// Remote and in-memory agreement
// ============================================================================

enum Term {
    Column(String, String),
    Param(Value),
}

enum Predicate {
    Compare(Term, String, Term),
    IsNull(Term),
    Any(Vec<Predicate>),
}

/// Split `text` on `separator` outside parentheses.
fn split_top<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < text.len() {
        match text.as_bytes()[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 && text[i..].starts_with(separator) => {
                parts.push(&text[start..i]);
                i += separator.len();
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&text[start..]);
    parts
}

fn term<'a>(token: &str, params: &mut impl Iterator<Item = &'a Value>) -> Term {
    if token == "?" {
        return Term::Param(params.next().cloned().unwrap());
    }
    let (alias, column) = token.split_once('.').unwrap();
    Term::Column(alias.to_string(), column.to_string())
}

fn predicate<'a>(text: &str, params: &mut impl Iterator<Item = &'a Value>) -> Predicate {
    if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        return Predicate::Any(
            split_top(inner, " or ")
                .into_iter()
                .map(|part| predicate(part, params))
                .collect(),
        );
    }
    if let Some(column) = text.strip_suffix(" is null") {
        return Predicate::IsNull(term(column, params));
    }
    let tokens: Vec<&str> = text.split_whitespace().collect();
    assert_eq!(tokens.len(), 3, "unexpected condition `{text}`");
    let left = term(tokens[0], params);
    let right = term(tokens[2], params);
    Predicate::Compare(left, tokens[1].to_string(), right)
}

/// Column value; milestone columns are stored under their column names.
fn column_value(schema: &Schema, object: &ObjectRef, column: &str) -> Value {
    let stored = object.value(column);
    if !stored.is_null() {
        return stored.clone();
    }
    schema
        .get(object.entity())
        .and_then(|meta| meta.field_by_column(column).cloned())
        .map_or(Value::Null, |field| object.value_of(&field).clone())
}

fn holds(schema: &Schema, query: &SqlQuery, row: &[ObjectRef], predicate: &Predicate) -> bool {
    let value = |term: &Term| match term {
        Term::Param(value) => value.clone(),
        Term::Column(alias, column) => {
            let slot = query.tables().iter().position(|t| &t.alias == alias).unwrap();
            column_value(schema, &row[slot], column)
        }
    };
    match predicate {
        Predicate::IsNull(term) => value(term).is_null(),
        Predicate::Any(parts) => parts.iter().any(|p| holds(schema, query, row, p)),
        Predicate::Compare(left, op, right) => {
            let (l, r) = (value(left), value(right));
            if l.is_null() || r.is_null() {
                return false;
            }
            match op.as_str() {
                "=" => l == r,
                "<>" => l != r,
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                ">=" => l >= r,
                other => panic!("unexpected operator `{other}`"),
            }
        }
    }
}

/// Run `query` over the cached rows by nested loops with SQL null semantics.
fn run_sql(query: &SqlQuery, cache: &MemoryCache, schema: &Schema) -> Vec<Value> {
    let mut params = query.params().iter();
    let predicates: Vec<Predicate> = if query.where_clause().is_empty() {
        Vec::new()
    } else {
        split_top(query.where_clause(), " and ")
            .into_iter()
            .map(|part| predicate(part, &mut params))
            .collect()
    };
    assert!(params.next().is_none(), "every parameter is consumed");

    let extents: Vec<Vec<ObjectRef>> = query
        .tables()
        .iter()
        .map(|t| cache.objects(&t.entity))
        .collect();
    let select = query
        .tables()
        .iter()
        .position(|t| t.alias == query.select_alias())
        .unwrap();

    let mut rows: Vec<Vec<ObjectRef>> = vec![Vec::new()];
    for extent in &extents {
        rows = rows
            .into_iter()
            .flat_map(|row| {
                extent.iter().map(move |object| {
                    let mut next = row.clone();
                    next.push(object.clone());
                    next
                })
            })
            .collect();
    }

    let mut ids: Vec<Value> = rows
        .iter()
        .filter(|row| predicates.iter().all(|p| holds(schema, query, row, p)))
        .map(|row| row[select].value("id").clone())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

#[test]
fn test_open_milestones_match_in_memory_and_remote() {
    init_tracing();
    let schema = schema(None);
    let cache = cache(&schema, CacheMode::Full);
    let config = MapperConfig::default();
    let resolver = Resolver::new(MapperContext::new(&cache, &schema, &config));
    let business_date = schema.field("Customer", "businessDate").unwrap();

    for day in 1..=9 {
        let op = Operation::mapped(
            to_customer(&schema),
            Operation::as_of_eq(&business_date, date(day)),
        );
        let in_memory = order_ids(&resolver.resolve(&op).unwrap());
        assert_eq!(in_memory, vec![1.into(), 2.into(), 3.into()], "as of day {day}");

        let (prepared, analysis) = resolver.prepare(&op).unwrap();
        let query = SqlQuery::for_operation(&prepared, &schema, &config, Some(&analysis)).unwrap();
        assert_eq!(run_sql(&query, &cache, &schema), in_memory, "as of day {day}");
    }
}
