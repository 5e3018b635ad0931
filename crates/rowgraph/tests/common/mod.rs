//! Shared fixtures for the rowgraph integration tests.

#![allow(dead_code)]

use rowgraph::{EntityMapping, Error, Outcome, Row, Value};
use std::sync::Arc;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

pub fn customers() -> Arc<EntityMapping> {
    EntityMapping::builder("Customer", "customers", "id")
        .attribute("name", "name")
        .build()
        .expect("customer mapping")
}

pub fn orders() -> Arc<EntityMapping> {
    EntityMapping::builder("Order", "orders", "id")
        .attribute("total", "total")
        .attribute("status", "status")
        .version("version", "version")
        .references("Customer")
        .build()
        .expect("order mapping")
}

pub fn order_lines() -> Arc<EntityMapping> {
    EntityMapping::builder("OrderLine", "order_lines", "id")
        .attribute("sku", "sku")
        .references("Order")
        .build()
        .expect("order line mapping")
}

pub fn tags() -> Arc<EntityMapping> {
    EntityMapping::builder("Tag", "tags", "id")
        .attribute("label", "label")
        .build()
        .expect("tag mapping")
}

pub const ORDER_COLUMNS: [&str; 9] = [
    "o__id",
    "o__version",
    "o__total",
    "o__status",
    "o__customer_id",
    "c__id",
    "c__name",
    "l__id",
    "l__sku",
];

/// One row of an order joined to its customer and one of its lines.
pub fn order_row(order: i64, customer: Option<i64>, line: Option<i64>) -> Row {
    Row::new(
        ORDER_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
        vec![
            Value::BigInt(order),
            Value::BigInt(3),
            Value::BigInt(order * 100),
            Value::Text("new".to_string()),
            Value::from(customer),
            Value::from(customer),
            Value::from(customer.map(|c| format!("customer {c}"))),
            Value::from(line),
            Value::from(line.map(|l| format!("SKU-{l}"))),
        ],
    )
}
