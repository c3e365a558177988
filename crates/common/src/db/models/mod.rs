//! SeaORM entity models
//!
//! Invoice tables as written by the extraction pipeline

mod invoice;
mod line_item;

pub use invoice::{
    Entity as InvoiceEntity,
    Model as Invoice,
    ActiveModel as InvoiceActiveModel,
    Column as InvoiceColumn,
};

pub use line_item::{
    Entity as LineItemEntity,
    Model as LineItem,
    ActiveModel as LineItemActiveModel,
    Column as LineItemColumn,
};
