//! Per-job-type fairness shares and the (model, jobType) slot sizing they drive.
//!
//! This is the closest analogue in this crate to the teacher's
//! `limiter::partitioning::PartitionedLimiter`: a shared pool divided into weighted shares.
//! The teacher's shares are static; here they're periodically rebalanced by observed load
//! (§4.5), so `current_ratio` lives behind a lock rather than being baked in at construction.

use std::collections::HashMap;
use std::sync::RwLock;

use conv::{ConvAsUtil, ConvUtil};

use crate::config::{JobTypeConfig, ModelConfig, RatioAdjustmentConfig};
use crate::error::ConfigError;

/// Resolve the resource estimate for one (jobType, model) pair: the job type's per-model
/// override if configured, else the model's default estimate.
pub fn estimate_inputs(
    job_types: &HashMap<String, JobTypeConfig>,
    job_type_id: &str,
    model_id: &str,
    model_config: &ModelConfig,
) -> EstimateInputs {
    let estimate = job_types
        .get(job_type_id)
        .and_then(|jt| jt.estimate_overrides.get(model_id))
        .copied()
        .unwrap_or(model_config.default_estimate);

    EstimateInputs {
        estimated_tokens: estimate.estimated_used_tokens,
        estimated_requests: estimate.estimated_number_of_requests,
        estimated_memory_kb: estimate.estimated_used_memory_kb,
    }
}

const RATIO_EPSILON: f64 = 1e-6;

struct JobTypeEntry {
    initial_value: f64,
    flexible: bool,
    current_ratio: RwLock<f64>,
}

/// Observed load for one job type, used to drive ratio adjustment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Load {
    /// jobs currently in flight for this job type
    pub in_flight: u64,
    /// slots currently allocated to this job type (`None` = unlimited)
    pub allocated: Option<u64>,
}

/// Inputs describing a model's currently allocated pool, for slot sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolInputs {
    /// tokens-per-minute allocated to this instance for this model
    pub tokens_per_minute: Option<u64>,
    /// requests-per-minute allocated to this instance for this model
    pub requests_per_minute: Option<u64>,
    /// total concurrency slots allocated to this instance for this model
    pub total_slots: Option<u64>,
    /// process-local memory budget available, in kilobytes
    pub local_memory_budget_kb: Option<u64>,
}

/// A job type's expected resource usage per event, for slot sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateInputs {
    /// expected tokens per event
    pub estimated_tokens: u64,
    /// expected requests per event
    pub estimated_requests: u64,
    /// expected memory per event, in kilobytes
    pub estimated_memory_kb: Option<u64>,
}

/// The result of sizing one (model, jobType) pair's slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocation {
    /// the computed slot count; `None` means unbounded (no configured dimension constrains it)
    pub slots: Option<u64>,
    /// whether the winning (smallest) candidate was a rate-based dimension (RPM/TPM/memory-rate)
    /// rather than the raw concurrency share — determines whether
    /// [`crate::admission::AdmissionCore`]'s layer-1 check reads a window counter or an
    /// in-flight counter.
    pub rate_based: bool,
}

/// Translates a model's distributed pool into per-jobType slot budgets, and periodically
/// rebalances `current_ratio` across flexible job types based on observed load.
pub struct JobTypeAllocator {
    job_types: HashMap<String, JobTypeEntry>,
    config: RatioAdjustmentConfig,
}

impl JobTypeAllocator {
    /// Build an allocator from configured job types, normalising so ratios sum to 1.0.
    ///
    /// If `configs` is empty, a single implicit job type `"default"` is created with a fixed
    /// ratio of 1.0 (spec §6.2: "defaults to the sole configured type").
    pub fn new(configs: &[JobTypeConfig], ratio_config: RatioAdjustmentConfig) -> Result<Self, ConfigError> {
        let mut job_types = HashMap::new();

        if configs.is_empty() {
            job_types.insert(
                "default".to_string(),
                JobTypeEntry {
                    initial_value: 1.0,
                    flexible: false,
                    current_ratio: RwLock::new(1.0),
                },
            );
            return Ok(Self {
                job_types,
                config: ratio_config,
            });
        }

        let sum: f64 = configs.iter().map(|c| c.ratio.initial_value).sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(ConfigError::InvalidRatio {
                job_type: configs
                    .iter()
                    .map(|c| c.id.clone())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: "initial ratios across all job types must sum to 1.0",
            });
        }

        for c in configs {
            if !(0.0..=1.0).contains(&c.ratio.initial_value) {
                return Err(ConfigError::InvalidRatio {
                    job_type: c.id.clone(),
                    reason: "initial_value must be within [0, 1]",
                });
            }
            job_types.insert(
                c.id.clone(),
                JobTypeEntry {
                    initial_value: c.ratio.initial_value,
                    flexible: c.ratio.flexible,
                    current_ratio: RwLock::new(c.ratio.initial_value),
                },
            );
        }

        Ok(Self {
            job_types,
            config: ratio_config,
        })
    }

    /// The current ratio for `job_type`, or `0.0` if unknown.
    pub fn current_ratio(&self, job_type: &str) -> f64 {
        self.job_types
            .get(job_type)
            .map(|e| *e.current_ratio.read().expect("ratio lock poisoned"))
            .unwrap_or(0.0)
    }

    /// Whether `job_type` is a known, configured job type.
    pub fn contains(&self, job_type: &str) -> bool {
        self.job_types.contains_key(job_type)
    }

    /// The sole configured job type id, if exactly one is configured.
    pub fn sole_job_type(&self) -> Option<&str> {
        if self.job_types.len() == 1 {
            self.job_types.keys().next().map(|s| s.as_str())
        } else {
            None
        }
    }

    /// Compute this job type's slot allocation against `pool`, per spec §4.5's formula:
    ///
    /// ```text
    /// tpm_slots  = floor(pool.tpm   * ratio / estimated_tokens)      if estimated_tokens > 0
    /// rpm_slots  = floor(pool.rpm   * ratio / estimated_requests)    if estimated_requests > 0
    /// conc_slots = floor(pool.total_slots * ratio)
    /// mem_slots  = floor(local_memory_budget * ratio / estimated_memory_kb) if set
    /// slots = max(min_job_type_capacity, min(tpm_slots, rpm_slots, conc_slots, mem_slots))
    /// ```
    ///
    /// Ties between candidates prefer the rate-based one, so refund accounting continues to
    /// flow through a window counter rather than a plain in-flight count.
    pub fn slots_for(&self, job_type: &str, pool: &PoolInputs, estimate: &EstimateInputs) -> SlotAllocation {
        let ratio = self.current_ratio(job_type);

        let tpm_slots = floor_ratio_slots(pool.tokens_per_minute, ratio, estimate.estimated_tokens);
        let rpm_slots = floor_ratio_slots(pool.requests_per_minute, ratio, estimate.estimated_requests);
        let mem_slots = match estimate.estimated_memory_kb {
            Some(mem) if mem > 0 => floor_ratio_slots(pool.local_memory_budget_kb, ratio, mem),
            _ => None,
        };
        let conc_slots = pool.total_slots.map(|total| {
            (total as f64 * ratio)
                .floor()
                .approx_as::<u64>()
                .unwrap_or(0)
        });

        let mut candidates: Vec<(Option<u64>, bool)> = vec![
            (tpm_slots, true),
            (rpm_slots, true),
            (mem_slots, true),
            (conc_slots, false),
        ];
        // stable order above already prefers rate-based candidates on ties, since we pick the
        // first minimal candidate encountered.
        candidates.retain(|(v, _)| v.is_some());

        if candidates.is_empty() {
            return SlotAllocation {
                slots: None,
                rate_based: false,
            };
        }

        let min_value = candidates.iter().filter_map(|(v, _)| *v).min().unwrap();
        let rate_based = candidates
            .iter()
            .find(|(v, _)| *v == Some(min_value))
            .map(|(_, rate_based)| *rate_based)
            .unwrap_or(false);

        let floor = self.config.min_job_type_capacity;
        SlotAllocation {
            slots: Some(min_value.max(floor)),
            rate_based,
        }
    }

    /// Run one ratio-adjustment cycle (spec §4.5).
    ///
    /// Classifies each flexible job type as donor (`load < donor_threshold`), receiver
    /// (`load > receiver_threshold`), or neutral. Donors give up to `max_adjustment` of their
    /// ratio (bounded by `min_ratio`); the pooled donation is split across receivers
    /// proportional to how far over `receiver_threshold` their load is, each gain capped at
    /// `max_adjustment`. If there are no donors or no receivers this cycle, ratios are
    /// untouched. The rounding residual needed to keep the total at exactly 1.0 is added to
    /// the largest receiver.
    pub fn adjust_ratios(&self, loads: &HashMap<String, Load>) {
        let donor_threshold = self.config.donor_threshold;
        let receiver_threshold = self.config.receiver_threshold;
        let max_adjustment = self.config.max_adjustment;
        let min_ratio = self.config.min_ratio;

        struct Candidate {
            id: String,
            load: f64,
            ratio: f64,
        }

        let mut donors = Vec::new();
        let mut receivers = Vec::new();

        for (id, entry) in &self.job_types {
            if !entry.flexible {
                continue;
            }
            let load = loads
                .get(id)
                .map(|l| match l.allocated {
                    None | Some(0) => 0.0,
                    Some(allocated) => l.in_flight as f64 / allocated as f64,
                })
                .unwrap_or(0.0);
            let ratio = *entry.current_ratio.read().expect("ratio lock poisoned");

            if load < donor_threshold {
                donors.push(Candidate {
                    id: id.clone(),
                    load,
                    ratio,
                });
            } else if load > receiver_threshold {
                receivers.push(Candidate {
                    id: id.clone(),
                    load,
                    ratio,
                });
            }
        }

        if donors.is_empty() || receivers.is_empty() {
            return;
        }

        let mut new_ratios: HashMap<String, f64> = self
            .job_types
            .iter()
            .map(|(id, e)| (id.clone(), *e.current_ratio.read().expect("ratio lock poisoned")))
            .collect();

        let mut donated_total = 0.0;
        for d in &donors {
            let room = (d.ratio - min_ratio).max(0.0);
            let delta = room.min(max_adjustment);
            if delta <= 0.0 {
                continue;
            }
            *new_ratios.get_mut(&d.id).expect("donor id is in job_types") -= delta;
            donated_total += delta;
        }

        if donated_total <= 0.0 {
            return;
        }

        let total_excess: f64 = receivers
            .iter()
            .map(|r| (r.load - receiver_threshold).max(0.0))
            .sum();
        if total_excess <= 0.0 {
            return;
        }

        let mut receiver_ids = Vec::with_capacity(receivers.len());
        for r in &receivers {
            let excess = (r.load - receiver_threshold).max(0.0);
            let share = donated_total * (excess / total_excess);
            let gain = share.min(max_adjustment);
            *new_ratios.get_mut(&r.id).expect("receiver id is in job_types") += gain;
            receiver_ids.push(r.id.clone());
        }

        let sum: f64 = new_ratios.values().sum();
        let residual = 1.0 - sum;
        if residual.abs() > RATIO_EPSILON {
            let target = receiver_ids
                .iter()
                .max_by(|a, b| new_ratios[*a].partial_cmp(&new_ratios[*b]).unwrap())
                .cloned()
                .unwrap_or_else(|| {
                    new_ratios
                        .iter()
                        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                        .map(|(id, _)| id.clone())
                        .expect("job_types is non-empty")
                });
            *new_ratios.get_mut(&target).expect("target exists") += residual;
        }

        for (id, ratio) in new_ratios {
            if let Some(entry) = self.job_types.get(&id) {
                if entry.flexible {
                    *entry.current_ratio.write().expect("ratio lock poisoned") =
                        ratio.clamp(min_ratio, 1.0);
                }
            }
        }
    }

    /// Reset every job type's ratio to its configured `initial_value`.
    pub fn reset_ratios(&self) {
        for entry in self.job_types.values() {
            *entry.current_ratio.write().expect("ratio lock poisoned") = entry.initial_value;
        }
    }
}

fn floor_ratio_slots(pool_amount: Option<u64>, ratio: f64, estimate: u64) -> Option<u64> {
    if estimate == 0 {
        return None; // no meaningful estimate ⇒ this dimension imposes no constraint
    }
    pool_amount.map(|amount| {
        ((amount as f64 * ratio) / estimate as f64)
            .floor()
            .approx_as::<u64>()
            .unwrap_or(0)
    })
}
