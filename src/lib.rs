// =============================================================================
// MARKETPLACE SERVICE - Library Root
// =============================================================================
// The binary in main.rs only wires things together; everything else lives
// here so integration tests under tests/ can drive the same code.
//
// MODULE MAP:
// - ledger        wallet arithmetic + ledger rows
// - allocator     credential record assignment
// - orders        order lifecycle, numbers, access rules
// - orchestrator  place_order and its atomic section
// - commission    referral payouts
// - fulfilment    admin deliver / refund of credential orders
// - deposits      wallet top-ups and their review
// - accounts      registration and referral codes
// =============================================================================

pub mod accounts;
pub mod allocator;
pub mod commission;
pub mod config;
pub mod db;
pub mod deposits;
pub mod error;
pub mod fulfilment;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod orders;

use crate::config::Config;
use crate::db::Database;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every request handler through State<Arc<AppState>>.
#[derive(Clone)]
pub struct AppState {
    // PostgreSQL pool; all money and stock coordination goes through it
    pub db: Database,

    // Redis connection for the product read-model cache
    pub redis: redis::aio::ConnectionManager,

    // Prometheus metrics handle
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,

    pub config: Config,
}
