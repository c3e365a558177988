//! Invoice entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "invoices")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Uploading user; `None` for shared seed data
    pub user_id: Option<i32>,

    #[sea_orm(column_type = "Text", unique)]
    pub order_id: String,

    /// Five-letter customer code, e.g. `VINET`
    #[sea_orm(column_type = "Text")]
    pub customer_id: String,

    pub invoice_date: Date,

    #[sea_orm(column_type = "Text", nullable)]
    pub contact_name: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub address: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub city: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub postal_code: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub country: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub customer_phone: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub customer_fax: Option<String>,

    pub total_price: f64,

    /// Extraction confidence in `[0, 1]`
    pub confidence_score: f64,

    /// Text the invoice was extracted from
    #[sea_orm(column_type = "Text", nullable)]
    pub raw_text: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::line_item::Entity")]
    LineItems,
}

impl Related<super::line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LineItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
