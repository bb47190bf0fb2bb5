//! Counters exported at `/metrics`.

use metrics::{counter, describe_counter};

pub const UPDATES: &str = "collab_updates_total";
pub const CLAIMS: &str = "collab_claims_total";
pub const JOINS: &str = "collab_joins_total";
pub const REORDER_GAPS: &str = "collab_reorder_gaps_total";

/// Call once after the recorder is installed.
pub fn register_metrics() {
    describe_counter!(UPDATES, "Field updates committed by this node");
    describe_counter!(CLAIMS, "Event claims attempted, by outcome");
    describe_counter!(JOINS, "Room joins served by this node");
    describe_counter!(REORDER_GAPS, "Update orders skipped after the reorder window");
}

pub fn update_applied() {
    counter!(UPDATES).increment(1);
}

/// `outcome` is one of `won`, `lost` or `fail_open`.
pub fn claim(outcome: &'static str) {
    counter!(CLAIMS, "outcome" => outcome).increment(1);
}

pub fn joined() {
    counter!(JOINS).increment(1);
}

pub fn reorder_gap(skipped: u64) {
    counter!(REORDER_GAPS).increment(skipped);
}
