// =============================================================================
// METRICS MODULE
// =============================================================================
// This module sets up Prometheus metrics for observability.
//
// LEARNING NOTES:
// - Prometheus uses a "pull" model - it scrapes /metrics endpoint
// - Counter: Only goes up (orders, ledger operations)
// - Gauge: Can go up or down (available credential records)
// - Histogram: Distribution of values in buckets (latency, order value)
//
// The helpers are safe to call before setup_metrics() runs (for example in
// tests): without an installed recorder the macros are no-ops.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Labels: product_type, outcome (success / rejected / failed)
pub const ORDERS_TOTAL: &str = "marketplace_orders_total";

/// Labels: product_type
pub const ORDER_VALUE: &str = "marketplace_order_value";

/// Labels: operation (debit / escrow / release / return / credit), status
pub const LEDGER_OPERATIONS_TOTAL: &str = "marketplace_ledger_operations_total";

/// Labels: status (success / short)
pub const INVENTORY_ALLOCATIONS_TOTAL: &str = "marketplace_inventory_allocations_total";

/// Labels: product_id
pub const INVENTORY_AVAILABLE: &str = "marketplace_inventory_available";

/// Labels: outcome (paid / skipped / failed)
pub const COMMISSIONS_TOTAL: &str = "marketplace_commissions_total";

/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Labels: operation (get / set / delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the global Prometheus recorder and return the render handle
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    // Order totals in currency units
    let value_buckets = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(Matcher::Full(ORDER_VALUE.to_string()), value_buckets)?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(ORDERS_TOTAL, "Order placement attempts by product type and outcome");
    describe_histogram!(ORDER_VALUE, "Total price of successfully placed orders");
    describe_counter!(LEDGER_OPERATIONS_TOTAL, "Wallet balance operations by outcome");
    describe_counter!(INVENTORY_ALLOCATIONS_TOTAL, "Credential allocation attempts");
    describe_gauge!(INVENTORY_AVAILABLE, "Unassigned credential records per product");
    describe_counter!(COMMISSIONS_TOTAL, "Referral commission payouts by outcome");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Record one `place_order` attempt
///
/// # Arguments
/// * `product_type` - "downloadable" or "credential"
/// * `outcome` - "success", "rejected" (precondition) or "failed" (atomic section)
pub fn record_order(product_type: &str, outcome: &str) {
    counter!(
        ORDERS_TOTAL,
        "product_type" => product_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_order_value(product_type: &str, value: f64) {
    histogram!(ORDER_VALUE, "product_type" => product_type.to_string()).record(value);
}

pub fn record_ledger_operation(operation: &str, success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(
        LEDGER_OPERATIONS_TOTAL,
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_allocation(success: bool) {
    let status = if success { "success" } else { "short" };
    counter!(INVENTORY_ALLOCATIONS_TOTAL, "status" => status.to_string()).increment(1);
}

pub fn set_inventory_available(product_id: &str, available: i64) {
    gauge!(INVENTORY_AVAILABLE, "product_id" => product_id.to_string()).set(available as f64);
}

pub fn record_commission(outcome: &str) {
    counter!(COMMISSIONS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}
