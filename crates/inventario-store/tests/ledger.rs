//! Integration tests for the movement ledger through the gateway.

mod common;

use common::TestContext;
use inventario_store::{MovementKind, NewPurchase, PurchaseLine, StoreError, Value};

fn purchase(product_id: i64, unit_cost: f64, at: &str) -> NewPurchase {
    NewPurchase {
        supplier_id: None,
        invoice_number: Some(format!("F-{unit_cost}")),
        purchased_at: Some(at.to_string()),
        discount: 0.0,
        notes: None,
        lines: vec![PurchaseLine {
            product_id,
            quantity: 1.0,
            unit_cost,
            discount: 0.0,
        }],
    }
}

#[tokio::test]
async fn stock_follows_ledger() {
    let ctx = TestContext::new().await;
    let id = ctx.insert_product("ACE-1", "Aceite 1L", 4.0).await;

    let empty = ctx
        .gateway
        .current_stock(id)
        .await
        .unwrap_or_else(|err| panic!("current_stock: {err}"));
    assert!(empty.stock_actual.abs() < f64::EPSILON);
    assert!(empty.ultimo_movimiento.is_none());

    ctx.movement(id, MovementKind::Inbound, 10.0).await;
    ctx.movement(id, MovementKind::Outbound, 3.0).await;
    ctx.movement(id, MovementKind::Adjustment, -1.0).await;

    let level = ctx
        .gateway
        .current_stock(id)
        .await
        .unwrap_or_else(|err| panic!("current_stock: {err}"));
    assert!((level.stock_actual - 6.0).abs() < f64::EPSILON);
    assert!(level.ultimo_movimiento.is_some());
    assert_eq!(level.tipo_ultimo_movimiento, Some(MovementKind::Adjustment));
}

#[tokio::test]
async fn movement_for_missing_product_is_reference_error() {
    let ctx = TestContext::new().await;

    let result = ctx
        .gateway
        .execute(
            "INSERT INTO movimientos_inventario (producto_id, tipo_movimiento, cantidad)
             VALUES (?, 'entrada', 1)",
            vec![Value::Integer(404)],
        )
        .await;
    assert!(matches!(result, Err(StoreError::Reference(_))));

    let read = ctx.gateway.current_stock(404).await;
    assert!(matches!(read, Err(StoreError::Reference(_))));
}

#[tokio::test]
async fn internal_codes_are_unique_but_optional() {
    let ctx = TestContext::new().await;
    ctx.insert_product("DUP-1", "Primero", 1.0).await;

    let duplicate = ctx
        .gateway
        .execute(
            "INSERT INTO productos (codigo_interno, nombre) VALUES ('DUP-1', 'Segundo')",
            vec![],
        )
        .await;
    assert!(matches!(duplicate, Err(StoreError::Statement(_))));

    // Inactive products still hold their code
    ctx.gateway
        .execute("UPDATE productos SET activo = 0 WHERE codigo_interno = 'DUP-1'", vec![])
        .await
        .unwrap_or_else(|err| panic!("deactivate: {err}"));
    let still_duplicate = ctx
        .gateway
        .execute(
            "INSERT INTO productos (codigo_interno, nombre) VALUES ('DUP-1', 'Tercero')",
            vec![],
        )
        .await;
    assert!(still_duplicate.is_err());

    for name in ["Sin codigo A", "Sin codigo B"] {
        ctx.gateway
            .execute(
                "INSERT INTO productos (codigo_interno, nombre) VALUES (NULL, ?)",
                vec![Value::from(name)],
            )
            .await
            .unwrap_or_else(|err| panic!("NULL code insert failed: {err}"));
    }
    assert_eq!(ctx.count("productos").await, 3);
}

#[tokio::test]
async fn last_cost_prefers_latest_purchase() {
    let ctx = TestContext::new().await;
    let id = ctx.insert_product("CAF-1", "Cafe 500g", 3.0).await;

    let product_only = ctx
        .gateway
        .last_unit_cost(id)
        .await
        .unwrap_or_else(|err| panic!("last_unit_cost: {err}"));
    assert!((product_only - 3.0).abs() < f64::EPSILON);

    for (unit_cost, at) in [
        (5.0, "2026-01-10 10:00:00"),
        (7.0, "2026-01-12 10:00:00"),
        (6.0, "2026-01-11 10:00:00"),
    ] {
        ctx.gateway
            .record_purchase(purchase(id, unit_cost, at))
            .await
            .unwrap_or_else(|err| panic!("record_purchase: {err}"));
    }

    let latest = ctx
        .gateway
        .last_unit_cost(id)
        .await
        .unwrap_or_else(|err| panic!("last_unit_cost: {err}"));
    assert!((latest - 7.0).abs() < f64::EPSILON, "newest purchase date wins");

    // Same timestamp as the newest: the later row wins
    ctx.gateway
        .record_purchase(purchase(id, 8.0, "2026-01-12 10:00:00"))
        .await
        .unwrap_or_else(|err| panic!("record_purchase: {err}"));
    let tie = ctx
        .gateway
        .last_unit_cost(id)
        .await
        .unwrap_or_else(|err| panic!("last_unit_cost: {err}"));
    assert!((tie - 8.0).abs() < f64::EPSILON);

    let inventory = ctx
        .gateway
        .inventory()
        .await
        .unwrap_or_else(|err| panic!("inventory: {err}"));
    let item = inventory
        .iter()
        .find(|i| i.producto_id == id)
        .unwrap_or_else(|| panic!("product missing from inventory"));
    assert!((item.stock_actual - 4.0).abs() < f64::EPSILON);
    assert!((item.valor_total - 32.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn low_stock_uses_reorder_threshold() {
    let ctx = TestContext::new().await;
    let bajo = ctx.insert_product("BAJ-1", "Bajo", 1.0).await;
    let alto = ctx.insert_product("ALT-1", "Alto", 1.0).await;
    ctx.movement(bajo, MovementKind::Inbound, 5.0).await;
    ctx.movement(alto, MovementKind::Inbound, 50.0).await;

    let low = ctx
        .gateway
        .low_stock()
        .await
        .unwrap_or_else(|err| panic!("low_stock: {err}"));
    let ids: Vec<i64> = low.iter().map(|i| i.producto_id).collect();
    assert_eq!(ids, vec![bajo]);

    let history = ctx
        .gateway
        .movements(bajo, 10)
        .await
        .unwrap_or_else(|err| panic!("movements: {err}"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stock_nuevo, Some(5.0));
}
