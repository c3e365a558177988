//! Repository pattern for database operations
//!
//! Read access to the invoice tables. Every user-supplied value is bound as a
//! `$n` parameter; only fixed SQL fragments are formatted into statements.

use crate::db::models::*;
use crate::db::DbPool;
use crate::engine::{Aggregate, Fields, StructuredConstraints, StructuredRow, StructuredStore};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait, PaginatorTrait,
    LoaderTrait, QueryFilter, QueryOrder, QueryResult, QuerySelect, Statement,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

/// Line item as aggregated alongside its invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemSummary {
    pub description: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub line_total: f64,
}

impl LineItemSummary {
    /// `Chai (qty 10, unit price 14.4)`
    pub fn render(&self) -> String {
        let mut details = Vec::new();
        if let Some(quantity) = self.quantity {
            details.push(format!("qty {}", quantity));
        }
        if let Some(unit_price) = self.unit_price {
            details.push(format!("unit price {}", unit_price));
        }
        if details.is_empty() {
            self.description.clone()
        } else {
            format!("{} ({})", self.description, details.join(", "))
        }
    }
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Invoice Operations
    // ========================================================================

    /// Find an invoice and its line items by order id
    pub async fn find_invoice_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<(Invoice, Vec<LineItem>)>> {
        let mut found = InvoiceEntity::find()
            .filter(InvoiceColumn::OrderId.eq(order_id))
            .find_with_related(LineItemEntity)
            .all(self.read_conn())
            .await?;

        Ok(found.pop())
    }

    /// Invoices with their line items, oldest first
    pub async fn list_invoices_with_line_items(
        &self,
        limit: u64,
    ) -> Result<Vec<(Invoice, Vec<LineItem>)>> {
        let invoices = InvoiceEntity::find()
            .order_by_asc(InvoiceColumn::InvoiceDate)
            .order_by_asc(InvoiceColumn::OrderId)
            .limit(limit)
            .all(self.read_conn())
            .await?;

        // Second query so the limit applies to invoices, not joined rows
        let line_items = invoices.load_many(LineItemEntity, self.read_conn()).await?;

        Ok(invoices.into_iter().zip(line_items).collect())
    }

    /// Number of stored invoices
    pub async fn count_invoices(&self) -> Result<u64> {
        let count = InvoiceEntity::find().count(self.read_conn()).await?;
        Ok(count)
    }

    // ========================================================================
    // Structured Lookup
    // ========================================================================

    /// Run a structured lookup against the invoice tables
    pub async fn lookup_rows(&self, constraints: &StructuredConstraints) -> Result<Vec<StructuredRow>> {
        constraints.validate()?;

        let (sql, values) = build_lookup(constraints);
        debug!(sql = %sql, params = values.len(), "Structured lookup");

        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, &sql, values);
        let rows = self.read_conn().query_all(stmt).await?;

        let results = match constraints.aggregate {
            None => rows.iter().filter_map(invoice_row).collect(),
            Some(Aggregate::OrderCount) if constraints.groups_by_customer() => rows
                .iter()
                .filter_map(|row| customer_row(row, "order_count"))
                .collect(),
            Some(Aggregate::OrderCount) => rows
                .iter()
                .filter_map(order_count_row)
                // Nothing matched the product, leave the answer to the semantic side
                .filter(|row| constraints.product.is_none() || row.fields.get("order_count") != Some(&json!(0)))
                .collect(),
            Some(Aggregate::TotalSpent) => rows
                .iter()
                .filter_map(|row| customer_row(row, "total_spent"))
                .collect(),
            Some(Aggregate::TopProducts) => rows.iter().filter_map(product_row).collect(),
            Some(Aggregate::AverageOrderValue) => rows.iter().filter_map(average_row).collect(),
        };

        Ok(results)
    }
}

#[async_trait]
impl StructuredStore for Repository {
    async fn lookup(&self, constraints: &StructuredConstraints) -> Result<Vec<StructuredRow>> {
        self.lookup_rows(constraints).await
    }
}

// ============================================================================
// SQL construction
// ============================================================================

/// Collects `WHERE` clauses with sequentially numbered bind parameters
#[derive(Default)]
struct WhereBuilder {
    clauses: Vec<String>,
    values: Vec<sea_orm::Value>,
}

impl WhereBuilder {
    /// Next placeholder, e.g. `$3`
    fn bind(&mut self, value: impl Into<sea_orm::Value>) -> String {
        self.values.push(value.into());
        format!("${}", self.values.len())
    }

    fn push(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// `line_items_joined` when the statement already joins `line_items li`
fn filters(constraints: &StructuredConstraints, line_items_joined: bool) -> WhereBuilder {
    let mut builder = WhereBuilder::default();

    if let Some(order_id) = &constraints.order_id {
        let p = builder.bind(order_id.clone());
        builder.push(format!("i.order_id = {}", p));
    }

    if let Some(code) = &constraints.customer_code {
        let p = builder.bind(code.to_uppercase());
        builder.push(format!("i.customer_id = {}", p));
    }

    if let Some(name) = &constraints.customer_name {
        let p = builder.bind(format!("%{}%", escape_like(name.trim())));
        builder.push(format!("i.contact_name ILIKE {}", p));
    }

    if let Some(product) = &constraints.product {
        let p = builder.bind(format!("%{}%", escape_like(product.trim())));
        if line_items_joined {
            builder.push(format!("li.description ILIKE {}", p));
        } else {
            builder.push(format!(
                "EXISTS (SELECT 1 FROM line_items p WHERE p.invoice_id = i.id AND p.description ILIKE {})",
                p
            ));
        }
    }

    if let Some(range) = &constraints.date_range {
        if let Some(start) = range.start {
            let p = builder.bind(start);
            builder.push(format!("i.invoice_date >= {}", p));
        }
        if let Some(end) = range.end {
            let p = builder.bind(end);
            builder.push(format!("i.invoice_date <= {}", p));
        }
    }

    if let Some(user_id) = constraints.user_id {
        let p = builder.bind(user_id);
        builder.push(format!("(i.user_id = {} OR i.user_id IS NULL)", p));
    }

    builder
}

fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Build the statement for a lookup
fn build_lookup(constraints: &StructuredConstraints) -> (String, Vec<sea_orm::Value>) {
    let line_items_joined = constraints.aggregate == Some(Aggregate::TopProducts);
    let mut builder = filters(constraints, line_items_joined);
    let where_sql = builder.sql();

    let sql = match constraints.aggregate {
        None => {
            let limit = builder.bind(constraints.limit as i64);
            format!(
                r#"
                SELECT
                    i.order_id,
                    i.customer_id,
                    i.contact_name,
                    i.invoice_date,
                    i.city,
                    i.country,
                    i.total_price,
                    COALESCE(
                        json_agg(
                            json_build_object(
                                'description', li.description,
                                'quantity', li.quantity,
                                'unit_price', li.unit_price,
                                'line_total', li.line_total
                            ) ORDER BY li.id
                        ) FILTER (WHERE li.id IS NOT NULL),
                        '[]'::json
                    ) AS line_items
                FROM invoices i
                LEFT JOIN line_items li ON li.invoice_id = i.id
                {}
                GROUP BY i.id
                ORDER BY i.invoice_date DESC, i.order_id
                LIMIT {}
                "#,
                where_sql, limit
            )
        }
        Some(Aggregate::OrderCount) if !constraints.groups_by_customer() => format!(
            r#"
            SELECT
                COUNT(DISTINCT i.order_id)::bigint AS order_count,
                COUNT(DISTINCT i.customer_id)::bigint AS customer_count
            FROM invoices i
            {}
            "#,
            where_sql
        ),
        Some(Aggregate::OrderCount) | Some(Aggregate::TotalSpent) => {
            let measure = match constraints.aggregate {
                Some(Aggregate::TotalSpent) => "SUM(i.total_price)::float8",
                _ => "COUNT(*)::float8",
            };
            let limit = builder.bind(constraints.limit as i64);
            format!(
                r#"
                SELECT
                    COALESCE(i.contact_name, i.customer_id) AS customer,
                    {} AS measure,
                    COUNT(*)::bigint AS orders
                FROM invoices i
                {}
                GROUP BY 1
                ORDER BY 2 DESC, 1
                LIMIT {}
                "#,
                measure, where_sql, limit
            )
        }
        Some(Aggregate::TopProducts) => {
            let limit = builder.bind(constraints.limit as i64);
            format!(
                r#"
                SELECT
                    li.description,
                    SUM(COALESCE(li.quantity, 0))::float8 AS total_quantity,
                    COUNT(DISTINCT i.id)::bigint AS orders
                FROM line_items li
                JOIN invoices i ON li.invoice_id = i.id
                {}
                GROUP BY li.description
                ORDER BY 2 DESC, 1
                LIMIT {}
                "#,
                where_sql, limit
            )
        }
        Some(Aggregate::AverageOrderValue) => format!(
            r#"
            SELECT
                AVG(i.total_price)::float8 AS average_order_value,
                COUNT(*)::bigint AS orders
            FROM invoices i
            {}
            "#,
            where_sql
        ),
    };

    (sql, builder.values)
}

// ============================================================================
// Row mapping
// ============================================================================

fn invoice_row(row: &QueryResult) -> Option<StructuredRow> {
    let order_id = row.try_get_by_index::<String>(0).ok()?;
    let line_items: Vec<LineItemSummary> = row
        .try_get_by_index::<JsonValue>(7)
        .ok()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();

    let mut fields = Fields::new();
    fields.insert("order_id".into(), json!(order_id));
    fields.insert("customer_id".into(), json!(row.try_get_by_index::<String>(1).ok()?));
    insert_opt(&mut fields, "contact_name", row.try_get_by_index::<Option<String>>(2).ok()?);
    fields.insert(
        "invoice_date".into(),
        json!(row.try_get_by_index::<NaiveDate>(3).ok()?.to_string()),
    );
    insert_opt(&mut fields, "city", row.try_get_by_index::<Option<String>>(4).ok()?);
    insert_opt(&mut fields, "country", row.try_get_by_index::<Option<String>>(5).ok()?);
    fields.insert("total_price".into(), json!(row.try_get_by_index::<f64>(6).ok()?));
    fields.insert("products".into(), products_value(&line_items));

    Some(StructuredRow::new(order_id, fields))
}

fn customer_row(row: &QueryResult, measure: &str) -> Option<StructuredRow> {
    let customer = row.try_get_by_index::<String>(0).ok()?;
    let value = row.try_get_by_index::<f64>(1).ok()?;
    let orders = row.try_get_by_index::<i64>(2).ok()?;

    let mut fields = Fields::new();
    fields.insert("contact_name".into(), json!(customer));
    if measure == "order_count" {
        fields.insert(measure.into(), json!(orders));
    } else {
        fields.insert(measure.into(), json!(round_cents(value)));
        fields.insert("order_count".into(), json!(orders));
    }

    Some(StructuredRow::new(format!("customer:{}", customer), fields))
}

fn order_count_row(row: &QueryResult) -> Option<StructuredRow> {
    let orders = row.try_get_by_index::<i64>(0).ok()?;
    let customers = row.try_get_by_index::<i64>(1).ok()?;

    let mut fields = Fields::new();
    fields.insert("order_count".into(), json!(orders));
    fields.insert("customer_count".into(), json!(customers));

    Some(StructuredRow::new("aggregate:order_count", fields))
}

fn product_row(row: &QueryResult) -> Option<StructuredRow> {
    let description = row.try_get_by_index::<String>(0).ok()?;
    let quantity = row.try_get_by_index::<f64>(1).ok()?;
    let orders = row.try_get_by_index::<i64>(2).ok()?;

    let mut fields = Fields::new();
    fields.insert("product".into(), json!(description));
    fields.insert("total_quantity".into(), json!(quantity));
    fields.insert("order_count".into(), json!(orders));

    Some(StructuredRow::new(format!("product:{}", description), fields))
}

fn average_row(row: &QueryResult) -> Option<StructuredRow> {
    // AVG over no rows is NULL
    let average = row.try_get_by_index::<Option<f64>>(0).ok()??;
    let orders = row.try_get_by_index::<i64>(1).ok()?;

    let mut fields = Fields::new();
    fields.insert("average_order_value".into(), json!(round_cents(average)));
    fields.insert("order_count".into(), json!(orders));

    Some(StructuredRow::new("aggregate:average_order_value", fields))
}

fn insert_opt(fields: &mut Fields, name: &str, value: Option<String>) {
    if let Some(value) = value {
        fields.insert(name.into(), json!(value));
    }
}

fn products_value(items: &[LineItemSummary]) -> JsonValue {
    JsonValue::Array(items.iter().map(|item| json!(item.render())).collect())
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
