//! Semantic index accessors
//!
//! - `PgVectorIndex`: pgvector nearest-neighbour search in Postgres
//! - `InMemoryIndex`: brute-force cosine search for development and tests
//!
//! Both index the same `IndexDocument`s, built per invoice at three
//! granularities by `documents_for_invoice`.

mod memory;
mod pgvector;

pub use memory::InMemoryIndex;
pub use pgvector::PgVectorIndex;

use crate::db::models::{Invoice, LineItem};
use crate::engine::{Fields, Granularity};
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One embeddable document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Stable document id, e.g. `item_10248_0`
    pub id: String,
    pub granularity: Granularity,
    pub order_id: String,
    pub user_id: Option<i32>,
    /// Text that gets embedded
    pub content: String,
    /// Returned with hits
    pub metadata: Fields,
}

/// Write side of a semantic index
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Embed and store documents. Every document previously stored for an
    /// order in the batch is removed first, so a batch must carry all of an
    /// order's documents. Returns the number of documents written.
    async fn index_documents(&self, documents: Vec<IndexDocument>) -> Result<usize>;
}

/// Build the invoice, product and line item documents for one invoice.
///
/// Invoices without line items only get the invoice document.
pub fn documents_for_invoice(invoice: &Invoice, line_items: &[LineItem]) -> Vec<IndexDocument> {
    let contact = invoice.contact_name.as_deref().unwrap_or("Unknown");
    let place = [invoice.city.as_deref(), invoice.country.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");

    let mut base = Fields::new();
    base.insert("order_id".into(), json!(invoice.order_id));
    base.insert("customer_id".into(), json!(invoice.customer_id));
    base.insert("contact_name".into(), json!(contact));
    base.insert("invoice_date".into(), json!(invoice.invoice_date.to_string()));

    let mut documents = Vec::with_capacity(line_items.len() + 2);

    let mut metadata = base.clone();
    metadata.insert("total_price".into(), json!(invoice.total_price));
    if let Some(city) = &invoice.city {
        metadata.insert("city".into(), json!(city));
    }
    if let Some(country) = &invoice.country {
        metadata.insert("country".into(), json!(country));
    }
    documents.push(IndexDocument {
        id: format!("invoice_{}", invoice.order_id),
        granularity: Granularity::Invoice,
        order_id: invoice.order_id.clone(),
        user_id: invoice.user_id,
        content: format!(
            "Invoice Order {id} for customer {contact} ({code}). Date: {date}. \
             Total amount: {total}. Customer details: {contact}, {place}. \
             Order ID {id}. Invoice {id}.",
            id = invoice.order_id,
            contact = contact,
            code = invoice.customer_id,
            date = invoice.invoice_date,
            total = invoice.total_price,
            place = place,
        ),
        metadata,
    });

    if line_items.is_empty() {
        return documents;
    }

    let product_lines = line_items
        .iter()
        .map(|item| {
            format!(
                "{} - quantity {} at {} each (total {}).",
                item.description,
                display_opt(item.quantity),
                display_opt(item.unit_price),
                item.line_total
            )
        })
        .collect::<Vec<_>>()
        .join(" ");

    let mut metadata = base.clone();
    metadata.insert(
        "products".into(),
        json!(line_items.iter().map(|i| i.description.as_str()).collect::<Vec<_>>()),
    );
    metadata.insert("product_count".into(), json!(line_items.len()));
    documents.push(IndexDocument {
        id: format!("products_{}", invoice.order_id),
        granularity: Granularity::Product,
        order_id: invoice.order_id.clone(),
        user_id: invoice.user_id,
        content: format!(
            "Order {id} contains the following products: {lines} \
             This order {id} was placed by {contact} on {date}.",
            id = invoice.order_id,
            lines = product_lines,
            contact = contact,
            date = invoice.invoice_date,
        ),
        metadata,
    });

    for (i, item) in line_items.iter().enumerate() {
        let mut metadata = base.clone();
        metadata.insert("product".into(), json!(item.description));
        if let Some(quantity) = item.quantity {
            metadata.insert("quantity".into(), json!(quantity));
        }
        if let Some(unit_price) = item.unit_price {
            metadata.insert("unit_price".into(), json!(unit_price));
        }
        metadata.insert("line_total".into(), json!(item.line_total));

        documents.push(IndexDocument {
            id: format!("item_{}_{}", invoice.order_id, i),
            granularity: Granularity::LineItem,
            order_id: invoice.order_id.clone(),
            user_id: invoice.user_id,
            content: format!(
                "Product {product} in order {id}. Customer {contact} ordered {qty} units of \
                 {product} at {price} per unit for a total of {total}. \
                 Order date: {date}. Order ID {id}.",
                product = item.description,
                id = invoice.order_id,
                contact = contact,
                qty = display_opt(item.quantity),
                price = display_opt(item.unit_price),
                total = item.line_total,
                date = invoice.invoice_date,
            ),
            metadata,
        });
    }

    documents
}

fn display_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

/// Render an embedding as a pgvector literal, `[0.1,0.2]`
pub(crate) fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::NaiveDate;

    pub fn invoice(order_id: &str, contact: &str, date: (i32, u32, u32), total: f64) -> Invoice {
        Invoice {
            id: order_id.parse().unwrap_or(0),
            user_id: None,
            order_id: order_id.to_string(),
            customer_id: "VINET".to_string(),
            invoice_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            contact_name: Some(contact.to_string()),
            address: None,
            city: Some("Reims".to_string()),
            postal_code: None,
            country: Some("France".to_string()),
            customer_phone: None,
            customer_fax: None,
            total_price: total,
            confidence_score: 0.95,
            raw_text: None,
        }
    }

    pub fn line_item(invoice_id: i32, description: &str, quantity: f64, unit_price: f64) -> LineItem {
        LineItem {
            id: 0,
            invoice_id,
            description: description.to_string(),
            quantity: Some(quantity),
            unit_price: Some(unit_price),
            line_total: quantity * unit_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_documents_for_invoice() {
        let invoice = invoice("10248", "Paul Henriot", (1996, 7, 4), 440.0);
        let items = vec![
            line_item(10248, "Queso Cabrales", 12.0, 14.0),
            line_item(10248, "Chai", 10.0, 18.0),
        ];

        let docs = documents_for_invoice(&invoice, &items);
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["invoice_10248", "products_10248", "item_10248_0", "item_10248_1"]);

        assert_eq!(docs[0].granularity, Granularity::Invoice);
        assert!(docs[0].content.contains("Paul Henriot"));
        assert!(docs[1].content.contains("Chai - quantity 10 at 18 each"));
        assert_eq!(docs[1].metadata["products"], json!(["Queso Cabrales", "Chai"]));
        assert_eq!(docs[3].metadata["product"], json!("Chai"));
        assert!(docs.iter().all(|d| d.order_id == "10248"));
    }

    #[test]
    fn test_invoice_without_items() {
        let invoice = invoice("10249", "Karin Josephs", (1996, 7, 5), 1863.4);
        let docs = documents_for_invoice(&invoice, &[]);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].metadata["total_price"], json!(1863.4));
    }

    #[test]
    fn test_vector_literal() {
        assert_eq!(vector_literal(&[0.5, -1.0]), "[0.5,-1]");
        assert_eq!(vector_literal(&[]), "[]");
    }
}
