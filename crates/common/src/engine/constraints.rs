//! Structured constraint extraction
//!
//! Turns a classified question into the parameters of a structured lookup:
//! identifiers, an inclusive date range, an aggregate and a row limit.

use super::strategy::{Classification, EntityRef};
use crate::errors::{AppError, Result};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Row cap for detail lookups
pub const DEFAULT_ROW_LIMIT: u64 = 50;

/// Inclusive date range, either end may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn is_open(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn is_inverted(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// Aggregate requested by the question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    /// Number of orders, overall or per customer
    OrderCount,
    /// Sum of invoice totals per customer
    TotalSpent,
    /// Products ranked by ordered quantity
    TopProducts,
    /// Mean invoice total
    AverageOrderValue,
}

/// Parameters for one structured lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredConstraints {
    pub order_id: Option<String>,
    pub customer_code: Option<String>,
    pub customer_name: Option<String>,
    pub date_range: Option<DateRange>,
    /// Only invoices with a line item whose description contains this text
    pub product: Option<String>,
    pub aggregate: Option<Aggregate>,
    /// Break aggregates down by customer
    pub per_customer: bool,
    /// Restricts rows to one uploading user
    pub user_id: Option<i32>,
    pub limit: u64,
    /// Problems found while reading the question
    #[serde(skip)]
    issues: Vec<String>,
}

impl Default for StructuredConstraints {
    fn default() -> Self {
        Self {
            order_id: None,
            customer_code: None,
            customer_name: None,
            date_range: None,
            product: None,
            aggregate: None,
            per_customer: false,
            user_id: None,
            limit: DEFAULT_ROW_LIMIT,
            issues: Vec::new(),
        }
    }
}

impl StructuredConstraints {
    pub fn for_order(order_id: impl Into<String>) -> Self {
        Self {
            order_id: Some(order_id.into()),
            ..Self::default()
        }
    }

    pub fn for_customer_code(code: impl Into<String>) -> Self {
        Self {
            customer_code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn for_customer_name(name: impl Into<String>) -> Self {
        Self {
            customer_name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn per_customer(mut self) -> Self {
        self.per_customer = true;
        self
    }

    /// Whether order counts are grouped by customer rather than totalled
    pub fn groups_by_customer(&self) -> bool {
        self.per_customer || self.customer_code.is_some() || self.customer_name.is_some()
    }

    pub fn with_user(mut self, user_id: Option<i32>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// True when nothing narrows or shapes the lookup
    pub fn is_empty(&self) -> bool {
        self.order_id.is_none()
            && self.customer_code.is_none()
            && self.customer_name.is_none()
            && self.product.is_none()
            && self.date_range.map_or(true, |r| r.is_open())
            && self.aggregate.is_none()
    }

    /// Reject constraints the structured store cannot run
    pub fn validate(&self) -> Result<()> {
        if let Some(issue) = self.issues.first() {
            return Err(malformed(issue.clone()));
        }

        if let Some(order_id) = &self.order_id {
            if order_id.is_empty() || !order_id.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed(format!("order id '{}' is not numeric", order_id)));
            }
        }

        if let Some(code) = &self.customer_code {
            if code.is_empty() || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return Err(malformed(format!("customer code '{}' is invalid", code)));
            }
        }

        if let Some(name) = &self.customer_name {
            if name.trim().is_empty() {
                return Err(malformed("customer name is empty".to_string()));
            }
        }

        if let Some(product) = &self.product {
            if product.trim().is_empty() {
                return Err(malformed("product is empty".to_string()));
            }
        }

        if let Some(range) = &self.date_range {
            if range.is_inverted() {
                return Err(malformed("date range ends before it starts".to_string()));
            }
        }

        if self.limit == 0 {
            return Err(malformed("row limit must be positive".to_string()));
        }

        if self.is_empty() {
            return Err(malformed("question has no structured constraint".to_string()));
        }

        Ok(())
    }
}

fn malformed(message: String) -> AppError {
    AppError::MalformedConstraints { message }
}

/// Derive structured constraints from a question and its classification
pub fn extract_constraints(question: &str, classification: &Classification) -> StructuredConstraints {
    let mut constraints = StructuredConstraints::default();

    match classification.entity() {
        Some(EntityRef::Order(id)) => constraints.order_id = Some(id.clone()),
        Some(EntityRef::CustomerCode(code)) => constraints.customer_code = Some(code.clone()),
        Some(EntityRef::CustomerName(name)) => constraints.customer_name = Some(name.clone()),
        None => constraints.customer_name = classification.signals.mentioned_name.clone(),
    }

    let words = words(question);
    constraints.aggregate = detect_aggregate(&words);
    constraints.per_customer = asks_per_customer(&words);

    if classification.signals.descriptive {
        constraints.product = product_phrase(&words);

        // An aggregate over every invoice would ignore the product the question is about
        let unscoped = constraints.product.is_none() && classification.entity().is_none();
        if unscoped && constraints.aggregate != Some(Aggregate::TopProducts) {
            constraints.aggregate = None;
        }
    }

    let (range, issues) = extract_date_range(&words);
    constraints.date_range = range;
    constraints.issues = issues;

    constraints
}

fn words(question: &str) -> Vec<String> {
    question
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-')
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn detect_aggregate(words: &[String]) -> Option<Aggregate> {
    let text = format!(" {} ", words.join(" "));
    let has = |phrases: &[&str]| phrases.iter().any(|p| text.contains(&format!(" {} ", p)));

    let ranking = has(&["most", "top", "best selling", "best-selling", "popular", "most ordered"]);
    let product = has(&["product", "products", "item", "items"]);

    if ranking && product {
        Some(Aggregate::TopProducts)
    } else if has(&["average", "avg", "mean"]) {
        Some(Aggregate::AverageOrderValue)
    } else if has(&["spent", "spend", "how much", "total amount", "revenue", "total value", "sum"]) {
        Some(Aggregate::TotalSpent)
    } else if has(&["how many", "count", "number of"]) {
        Some(Aggregate::OrderCount)
    } else {
        None
    }
}

fn asks_per_customer(words: &[String]) -> bool {
    let text = format!(" {} ", words.join(" "));
    [
        "per customer",
        "by customer",
        "each customer",
        "every customer",
        "which customer",
        "which customers",
        "per contact",
    ]
    .iter()
    .any(|p| text.contains(&format!(" {} ", p)))
}

/// Words that introduce what an order contains
const PRODUCT_CUES: &[&str] = &[
    "contain", "contains", "containing", "contained", "include", "includes", "including",
    "included", "with",
];

/// Words that end a product phrase
const PRODUCT_STOPS: &[&str] = &[
    "in", "on", "at", "during", "since", "before", "after", "until", "till", "through",
    "between", "from", "for", "by", "per", "and", "or", "to", "that", "which", "who",
    "were", "was", "are", "is", "did", "do", "does", "have", "has", "order", "orders",
    "invoice", "invoices", "most", "top", "total", "count", "average",
];

const PRODUCT_FILLERS: &[&str] = &["a", "an", "the", "any", "some"];

const PRODUCT_GENERIC: &[&str] = &["product", "products", "item", "items"];

/// Text following a containment cue, e.g. `chai` in "orders containing Chai in 1997"
fn product_phrase(words: &[String]) -> Option<String> {
    let cue = words.iter().position(|w| PRODUCT_CUES.contains(&w.as_str()))?;

    let mut phrase: Vec<&str> = Vec::new();
    for word in &words[cue + 1..] {
        let word = word.as_str();
        if phrase.is_empty() && PRODUCT_FILLERS.contains(&word) {
            continue;
        }
        if PRODUCT_STOPS.contains(&word)
            || parse_year(word).is_some()
            || parse_iso(word).is_some()
            || month_number(word).is_some()
        {
            break;
        }
        phrase.push(word);
    }

    while phrase.last().map_or(false, |w| PRODUCT_GENERIC.contains(w)) {
        phrase.pop();
    }

    if phrase.is_empty() {
        None
    } else {
        Some(phrase.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Bound {
    Since,
    After,
    Before,
    Until,
    Plain,
}

fn bound_from(previous: Option<&String>) -> Bound {
    match previous.map(String::as_str) {
        Some("since") | Some("from") => Bound::Since,
        Some("after") => Bound::After,
        Some("before") => Bound::Before,
        Some("until") | Some("till") | Some("through") | Some("to") => Bound::Until,
        _ => Bound::Plain,
    }
}

fn month_number(word: &str) -> Option<u32> {
    let month = match word {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sep" | "sept" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn parse_year(word: &str) -> Option<i32> {
    if word.len() != 4 || !word.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    word.parse().ok().filter(|y| (1900..=2100).contains(y))
}

fn month_span(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next.pred_opt()?))
}

fn year_span(year: i32) -> Option<(NaiveDate, NaiveDate)> {
    Some((
        NaiveDate::from_ymd_opt(year, 1, 1)?,
        NaiveDate::from_ymd_opt(year, 12, 31)?,
    ))
}

/// `Some(Ok(..))` for a valid ISO date, `Some(Err(..))` for a date-shaped but invalid token
fn parse_iso(word: &str) -> Option<std::result::Result<NaiveDate, String>> {
    let parts: Vec<&str> = word.split('-').collect();
    if parts.len() != 3
        || parts[0].len() != 4
        || !parts.iter().all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }

    let parsed = NaiveDate::parse_from_str(word, "%Y-%m-%d")
        .map_err(|_| format!("'{}' is not a valid date", word));
    Some(parsed)
}

/// Date expressions in question order, each with the word that bounds it
fn extract_date_range(words: &[String]) -> (Option<DateRange>, Vec<String>) {
    let mut spans: Vec<(Bound, NaiveDate, NaiveDate)> = Vec::new();
    let mut issues = Vec::new();

    let mut i = 0;
    while i < words.len() {
        let bound = bound_from(i.checked_sub(1).and_then(|p| words.get(p)));
        let word = words[i].as_str();

        if let Some(parsed) = parse_iso(word) {
            match parsed {
                Ok(date) => spans.push((bound, date, date)),
                Err(issue) => issues.push(issue),
            }
            i += 1;
            continue;
        }

        if let Some(month) = month_number(word) {
            if let Some(year) = words.get(i + 1).and_then(|w| parse_year(w)) {
                if let Some((first, last)) = month_span(year, month) {
                    spans.push((bound, first, last));
                }
                i += 2;
                continue;
            }
        }

        if let Some(year) = parse_year(word) {
            if let Some((first, last)) = year_span(year) {
                spans.push((bound, first, last));
            }
        }

        i += 1;
    }

    if spans.is_empty() {
        return (None, issues);
    }

    let mut range = DateRange::default();
    for (bound, first, last) in spans {
        match bound {
            Bound::Since => range.start = Some(first),
            Bound::After => range.start = last.succ_opt(),
            Bound::Before => range.end = first.pred_opt(),
            Bound::Until => range.end = Some(last),
            Bound::Plain => {
                // "in 1997" sets both ends, the second of "between X and Y" closes the range
                if range.start.is_none() {
                    range.start = Some(first);
                    range.end = Some(last);
                } else {
                    range.end = Some(last);
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (range.start, range.end) {
        tracing::debug!(start = %start, end = %end, year = start.year(), "Date range extracted");
    }

    (Some(range), issues)
}
