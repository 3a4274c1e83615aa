//! Public pricing: catalogue listing and pre-flight cost estimates.

use axum::Json;
use axum::extract::State;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::credits;
use crate::error::ApiError;
use crate::models::Product;
use crate::quota;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ProductPricing {
    pub product_id: String,
    pub name: String,
    pub credits_per_unit: f64,
    pub usd_per_unit: f64,
    pub unit_name: String,
    pub free_tier_daily: i64,
    pub free_tier_monthly: i64,
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<ProductPricing>>, ApiError> {
    let products: Vec<Product> = sqlx::query_as(
        "SELECT id, name, base_price_per_unit, unit_name, is_active
         FROM products
         WHERE is_active
         ORDER BY id",
    )
    .fetch_all(&state.db)
    .await?;

    Ok(Json(
        products
            .into_iter()
            .map(|product| {
                let limits = quota::base_limits(&product.id);
                let credits_per_unit = credits::product_info(&product.id)
                    .map(|info| info.credits_per_unit.to_f64().unwrap_or(0.0))
                    .unwrap_or(0.0);
                ProductPricing {
                    credits_per_unit,
                    usd_per_unit: product.base_price_per_unit.to_f64().unwrap_or(0.0),
                    product_id: product.id,
                    name: product.name,
                    unit_name: product.unit_name,
                    free_tier_daily: limits.daily,
                    free_tier_monthly: limits.monthly,
                }
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct EstimateRequest {
    pub product_id: String,
    pub units: i64,
}

#[derive(Serialize)]
pub struct EstimateResponse {
    pub product_id: String,
    pub units: i64,
    pub credits_cost: f64,
    pub usd_cost: f64,
    pub free_tier_daily: i64,
}

/// Price a prospective batch before running it.
pub async fn estimate(
    Json(req): Json<EstimateRequest>,
) -> Result<Json<EstimateResponse>, ApiError> {
    if req.units < 1 {
        return Err(ApiError::Validation("units must be at least 1".into()));
    }
    let credits_cost = credits::credits_for(&req.product_id, req.units)
        .ok_or_else(|| ApiError::Validation(format!("unknown product: {}", req.product_id)))?;
    let usd_cost = credits::price_usd(&req.product_id, req.units).expect("known product");

    Ok(Json(EstimateResponse {
        free_tier_daily: quota::base_limits(&req.product_id).daily,
        product_id: req.product_id,
        units: req.units,
        credits_cost: credits_cost.to_f64().unwrap_or(0.0),
        usd_cost: usd_cost.to_f64().unwrap_or(0.0),
    }))
}
