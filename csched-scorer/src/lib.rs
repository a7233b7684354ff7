//! Candidate scorer (spec C5 / §4.4): for each (function, region, hour)
//! triple in the planning horizon, compute expected energy, emissions,
//! transfer cost, and a normalized composite score.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use csched_types::{CandidateScore, CarbonForecast, FunctionMetadata, StaticCatalog};

/// Conservative default CPU utilization when no measured value is
/// available (spec §4.4).
pub const DEFAULT_CPU_UTIL: f64 = 0.10;
/// GPU utilization is fixed per catalog convention (spec §4.4).
pub const GPU_UTIL: f64 = 0.10;

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Expected energy in kWh for one invocation of `meta` if run in `region`.
pub fn energy_kwh_for_region(
    meta: &FunctionMetadata,
    catalog: &StaticCatalog,
    region: &str,
    measured_cpu_util: Option<f64>,
) -> Option<f64> {
    let entry = catalog.entry(region)?;
    let cpu_util = measured_cpu_util.unwrap_or(DEFAULT_CPU_UTIL);
    let cpu_power_w = meta.vcpus
        * (entry.cpu_min_w_per_vcpu + cpu_util * (entry.cpu_max_w_per_vcpu - entry.cpu_min_w_per_vcpu));
    let mem_gib = meta.memory_mib as f64 / 1024.0;
    let mem_power_w = mem_gib * entry.mem_w_per_gib;
    let gpu_power_w = if meta.gpu_required {
        let gpu_min = entry.gpu_min_w.unwrap_or(0.0);
        let gpu_max = entry.gpu_max_w.unwrap_or(0.0);
        gpu_min + GPU_UTIL * (gpu_max - gpu_min)
    } else {
        0.0
    };

    let runtime_hours = meta.runtime_ms as f64 / 1000.0 / 3600.0;
    let compute_kwh = (cpu_power_w + mem_power_w + gpu_power_w) / 1000.0 * runtime_hours * entry.pue;

    let bytes_total = (meta.input_bytes + meta.output_bytes) as f64;
    let network_kwh = bytes_total / BYTES_PER_GB * entry.network_kwh_per_gb;

    Some(compute_kwh + network_kwh)
}

/// Expected incremental transfer cost in USD of running `meta` in `region`,
/// relative to its source region.
pub fn transfer_cost_usd(meta: &FunctionMetadata, catalog: &StaticCatalog, region: &str) -> Option<f64> {
    let rate = catalog.egress_rate(region, &meta.source_region)?;
    Some(meta.output_bytes as f64 / BYTES_PER_GB * rate)
}

/// All (region, hour) candidates for `meta` over the forecast horizon,
/// scored but *not yet* composite-ranked (normalization happens below,
/// across the whole set so it's `min(f, horizon)`-relative, per spec).
///
/// `forecasts` maps each catalog zone key to its fetched forecast.
pub fn score_candidates(
    meta: &FunctionMetadata,
    catalog: &StaticCatalog,
    forecasts: &HashMap<String, CarbonForecast>,
    horizon_start: DateTime<Utc>,
    measured_cpu_util: Option<f64>,
) -> Vec<CandidateScore> {
    let mut candidates = Vec::new();

    for region in &meta.allowed_regions {
        if meta.gpu_required && !catalog.has_gpu(region) {
            continue;
        }
        let Some(entry) = catalog.entry(region) else {
            continue;
        };
        let Some(forecast) = forecasts.get(&entry.zone) else {
            continue;
        };
        let Some(energy) = energy_kwh_for_region(meta, catalog, region, measured_cpu_util) else {
            continue;
        };
        let Some(transfer_cost) = transfer_cost_usd(meta, catalog, region) else {
            continue;
        };

        for (hour_start, intensity) in &forecast.hours {
            if *hour_start < horizon_start {
                continue;
            }
            let emissions_g = energy * intensity;
            candidates.push(CandidateScore {
                function_id: meta.function_id.clone(),
                region: region.clone(),
                hour_start: *hour_start,
                energy_kwh: energy,
                emissions_g,
                transfer_cost_usd: transfer_cost,
                composite_score: 0.0,
            });
        }
    }

    normalize_composite(&mut candidates, meta, horizon_start);
    candidates
}

fn latency_penalty(meta: &FunctionMetadata, hour_start: DateTime<Utc>, horizon_start: DateTime<Utc>) -> f64 {
    let hour_offset = (hour_start - horizon_start).num_hours().max(0) as f64;
    let deadline = meta.deadline_hours.max(1) as f64;
    meta.weights.latency * hour_offset / deadline
}

fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    values
        .iter()
        .map(|v| if span.abs() < f64::EPSILON { 0.0 } else { (v - min) / span })
        .collect()
}

fn normalize_composite(candidates: &mut [CandidateScore], meta: &FunctionMetadata, horizon_start: DateTime<Utc>) {
    if candidates.is_empty() {
        return;
    }
    let emissions: Vec<f64> = candidates.iter().map(|c| c.emissions_g).collect();
    let costs: Vec<f64> = candidates.iter().map(|c| c.transfer_cost_usd).collect();
    let latencies: Vec<f64> = candidates
        .iter()
        .map(|c| latency_penalty(meta, c.hour_start, horizon_start))
        .collect();

    let norm_emissions = min_max_normalize(&emissions);
    let norm_costs = min_max_normalize(&costs);
    let norm_latencies = min_max_normalize(&latencies);

    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.composite_score = meta.weights.carbon * norm_emissions[i]
            + meta.weights.cost * norm_costs[i]
            + meta.weights.latency * norm_latencies[i];
    }
}
