//! Configuration data model (spec §6.4) and construction-time validation.
//!
//! Reading these structs from a file, environment, or remote config service is the host
//! process's job — this crate only validates the shape once it has one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-model immutable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// requests per minute, or `None` for unlimited
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    /// tokens per minute, or `None` for unlimited
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    /// requests per day, or `None` for unlimited
    #[serde(default)]
    pub requests_per_day: Option<u64>,
    /// tokens per day, or `None` for unlimited
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
    /// maximum concurrent in-flight requests, or `None` for unlimited
    #[serde(default)]
    pub max_concurrent_requests: Option<u64>,
    /// default per-event resource estimate, used unless a job type overrides it
    pub default_estimate: ResourceEstimate,
}

/// A resource estimate for one event: how much of each dimension a job is expected to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceEstimate {
    /// expected number of requests consumed
    #[serde(default = "one")]
    pub estimated_number_of_requests: u64,
    /// expected number of tokens consumed
    #[serde(default)]
    pub estimated_used_tokens: u64,
    /// expected memory used, in kilobytes
    #[serde(default)]
    pub estimated_used_memory_kb: Option<u64>,
}

fn one() -> u64 {
    1
}

/// A job type's fairness ratio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatioConfig {
    /// the starting (and, for fixed types, permanent) share of the pool, in `[0, 1]`
    pub initial_value: f64,
    /// whether [`crate::job_type::JobTypeAllocator`] may adjust this share over time
    pub flexible: bool,
}

/// A named class of jobs sharing an estimate profile and a fairness share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTypeConfig {
    /// stable job type id
    pub id: String,
    /// fairness ratio configuration
    pub ratio: RatioConfig,
    /// per-model `max_wait_ms` overrides
    #[serde(default)]
    pub max_wait_ms: HashMap<String, u64>,
    /// global `max_wait_ms` override, used when no per-model override matches
    #[serde(default)]
    pub default_max_wait_ms: Option<u64>,
    /// per-model resource estimate overrides
    #[serde(default)]
    pub estimate_overrides: HashMap<String, ResourceEstimate>,
}

/// Process-local memory gating policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// fraction of system-available memory this process may use for memory-bound jobs
    pub free_memory_ratio: f64,
    /// how often [`crate::memory::MemoryGovernor`] recomputes its allowed capacity
    pub recalculation_interval_ms: u64,
    /// cap on the system memory considered available, in kilobytes
    #[serde(default)]
    pub max_memory_kb: Option<u64>,
    /// floor for the computed allowed concurrent memory, in kilobytes
    #[serde(default)]
    pub min_capacity: Option<u64>,
    /// ceiling for the computed allowed concurrent memory, in kilobytes
    #[serde(default)]
    pub max_capacity: Option<u64>,
}

/// Tuning for [`crate::job_type::JobTypeAllocator`]'s periodic ratio redistribution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatioAdjustmentConfig {
    /// how often ratios are recomputed
    #[serde(default = "RatioAdjustmentConfig::default_interval_ms")]
    pub interval_ms: u64,
    /// maximum change to any one job type's ratio per cycle
    #[serde(default = "RatioAdjustmentConfig::default_max_adjustment")]
    pub max_adjustment: f64,
    /// floor every flexible job type's ratio must respect
    #[serde(default = "RatioAdjustmentConfig::default_min_ratio")]
    pub min_ratio: f64,
    /// load (in-flight / allocated) above which a job type is a receiver candidate
    #[serde(default = "RatioAdjustmentConfig::default_receiver_threshold")]
    pub receiver_threshold: f64,
    /// load below which a job type is a donor candidate
    #[serde(default = "RatioAdjustmentConfig::default_donor_threshold")]
    pub donor_threshold: f64,
    /// floor slot count given to every (model, job type) pair regardless of ratio
    #[serde(default)]
    pub min_job_type_capacity: u64,
}

impl RatioAdjustmentConfig {
    fn default_interval_ms() -> u64 {
        5_000
    }
    fn default_max_adjustment() -> f64 {
        0.1
    }
    fn default_min_ratio() -> f64 {
        0.01
    }
    fn default_receiver_threshold() -> f64 {
        0.70
    }
    fn default_donor_threshold() -> f64 {
        0.30
    }
}

impl Default for RatioAdjustmentConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
            max_adjustment: Self::default_max_adjustment(),
            min_ratio: Self::default_min_ratio(),
            receiver_threshold: Self::default_receiver_threshold(),
            donor_threshold: Self::default_donor_threshold(),
            min_job_type_capacity: 0,
        }
    }
}

/// Top-level scheduler configuration (spec §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// configured models, keyed by model id
    pub models: HashMap<String, ModelConfig>,
    /// escalation order across models; required when more than one model is configured
    #[serde(default)]
    pub escalation_order: Vec<String>,
    /// configured job types; if empty, a single implicit `"default"` type is used
    #[serde(default)]
    pub job_types: Vec<JobTypeConfig>,
    /// memory gating policy, if any
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
    /// ratio adjustment tuning
    #[serde(default)]
    pub ratio_adjustment: RatioAdjustmentConfig,
    /// coordinator heartbeat interval
    #[serde(default = "SchedulerConfig::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// coordinator heartbeat TTL; peers silent this long are dropped
    #[serde(default = "SchedulerConfig::default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// a human-readable label, used only in log lines
    #[serde(default)]
    pub label: Option<String>,
}

impl SchedulerConfig {
    fn default_heartbeat_interval_ms() -> u64 {
        5_000
    }
    fn default_heartbeat_timeout_ms() -> u64 {
        15_000
    }

    /// Validate the four fatal cases enumerated in spec §6.4.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }

        if self.models.len() > 1 && self.escalation_order.is_empty() {
            return Err(ConfigError::MissingEscalationOrder);
        }

        for model_id in &self.escalation_order {
            if !self.models.contains_key(model_id) {
                return Err(ConfigError::UnknownEscalationModel(model_id.clone()));
            }
        }

        if let Some(memory) = &self.memory {
            let any_declares_memory = self.models.values().any(|m| {
                m.default_estimate.estimated_used_memory_kb.is_some()
            }) || self.job_types.iter().any(|jt| {
                jt.estimate_overrides
                    .values()
                    .any(|e| e.estimated_used_memory_kb.is_some())
            });
            if !any_declares_memory {
                return Err(ConfigError::MemoryPolicyWithoutEstimate);
            }
            let _ = memory;
        }

        for (model_id, model) in &self.models {
            let rate_limits_tokens = model.tokens_per_minute.is_some() || model.tokens_per_day.is_some();
            let rate_limits_requests = model.requests_per_minute.is_some() || model.requests_per_day.is_some();

            if rate_limits_tokens
                && !self.any_resolved_estimate(model_id, model, |e| e.estimated_used_tokens > 0)
            {
                return Err(ConfigError::MissingEstimateForDimension {
                    model: model_id.clone(),
                    dimension: "tokens",
                });
            }
            if rate_limits_requests
                && !self.any_resolved_estimate(model_id, model, |e| e.estimated_number_of_requests > 0)
            {
                return Err(ConfigError::MissingEstimateForDimension {
                    model: model_id.clone(),
                    dimension: "requests",
                });
            }
        }

        for job_type in &self.job_types {
            let r = job_type.ratio.initial_value;
            if !(0.0..=1.0).contains(&r) {
                return Err(ConfigError::InvalidRatio {
                    job_type: job_type.id.clone(),
                    reason: "initial_value must be within [0, 1]",
                });
            }
        }

        Ok(())
    }

    /// Whether any job type's *resolved* estimate for `model_id` (its override, or the model's
    /// own default if it has none) satisfies `pred`. With no job types configured, the implicit
    /// `"default"` type always resolves to the model's own default estimate.
    fn any_resolved_estimate(
        &self,
        model_id: &str,
        model: &ModelConfig,
        pred: impl Fn(&ResourceEstimate) -> bool,
    ) -> bool {
        if self.job_types.is_empty() {
            return pred(&model.default_estimate);
        }
        self.job_types.iter().any(|jt| {
            let estimate = jt.estimate_overrides.get(model_id).unwrap_or(&model.default_estimate);
            pred(estimate)
        })
    }

    /// Escalation order to use: the configured one, or the sole model if there's only one.
    pub fn effective_escalation_order(&self) -> Vec<String> {
        if !self.escalation_order.is_empty() {
            self.escalation_order.clone()
        } else {
            self.models.keys().cloned().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_model() -> ModelConfig {
        ModelConfig {
            requests_per_minute: Some(10),
            tokens_per_minute: Some(100),
            requests_per_day: None,
            tokens_per_day: None,
            max_concurrent_requests: None,
            default_estimate: ResourceEstimate {
                estimated_number_of_requests: 1,
                estimated_used_tokens: 10,
                estimated_used_memory_kb: None,
            },
        }
    }

    #[test]
    fn rejects_empty_models() {
        let cfg = SchedulerConfig {
            models: HashMap::new(),
            escalation_order: vec![],
            job_types: vec![],
            memory: None,
            ratio_adjustment: RatioAdjustmentConfig::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15000,
            label: None,
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoModels)));
    }

    #[test]
    fn rejects_missing_escalation_order_with_multiple_models() {
        let mut models = HashMap::new();
        models.insert("alpha".to_string(), minimal_model());
        models.insert("beta".to_string(), minimal_model());
        let cfg = SchedulerConfig {
            models,
            escalation_order: vec![],
            job_types: vec![],
            memory: None,
            ratio_adjustment: RatioAdjustmentConfig::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15000,
            label: None,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingEscalationOrder)
        ));
    }

    #[test]
    fn rejects_unknown_escalation_model() {
        let mut models = HashMap::new();
        models.insert("alpha".to_string(), minimal_model());
        let cfg = SchedulerConfig {
            models,
            escalation_order: vec!["ghost".to_string()],
            job_types: vec![],
            memory: None,
            ratio_adjustment: RatioAdjustmentConfig::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15000,
            label: None,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownEscalationModel(_))
        ));
    }

    #[test]
    fn rejects_memory_policy_without_any_estimate() {
        let mut models = HashMap::new();
        models.insert("alpha".to_string(), minimal_model());
        let cfg = SchedulerConfig {
            models,
            escalation_order: vec![],
            job_types: vec![],
            memory: Some(MemoryConfig {
                free_memory_ratio: 0.5,
                recalculation_interval_ms: 1000,
                max_memory_kb: None,
                min_capacity: None,
                max_capacity: None,
            }),
            ratio_adjustment: RatioAdjustmentConfig::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15000,
            label: None,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MemoryPolicyWithoutEstimate)
        ));
    }

    #[test]
    fn rejects_request_dimension_without_estimate() {
        let mut model = minimal_model();
        model.default_estimate.estimated_number_of_requests = 0;
        let mut models = HashMap::new();
        models.insert("alpha".to_string(), model);
        let cfg = SchedulerConfig {
            models,
            escalation_order: vec![],
            job_types: vec![],
            memory: None,
            ratio_adjustment: RatioAdjustmentConfig::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15000,
            label: None,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingEstimateForDimension { dimension: "requests", .. })
        ));
    }

    #[test]
    fn job_type_without_override_falls_back_to_model_default_estimate() {
        let mut models = HashMap::new();
        models.insert("alpha".to_string(), minimal_model());
        let cfg = SchedulerConfig {
            models,
            escalation_order: vec![],
            job_types: vec![JobTypeConfig {
                id: "default".to_string(),
                ratio: RatioConfig {
                    initial_value: 1.0,
                    flexible: false,
                },
                max_wait_ms: HashMap::new(),
                default_max_wait_ms: None,
                estimate_overrides: HashMap::new(),
            }],
            memory: None,
            ratio_adjustment: RatioAdjustmentConfig::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15000,
            label: None,
        };
        // no job type declares an override, but the model's own default estimate is non-zero
        // on both dimensions, so this must still validate.
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn job_type_present_but_estimate_zero_everywhere_is_rejected() {
        let mut model = minimal_model();
        model.default_estimate.estimated_used_tokens = 0;
        let mut models = HashMap::new();
        models.insert("alpha".to_string(), model);
        let cfg = SchedulerConfig {
            models,
            escalation_order: vec![],
            job_types: vec![JobTypeConfig {
                id: "default".to_string(),
                ratio: RatioConfig {
                    initial_value: 1.0,
                    flexible: false,
                },
                max_wait_ms: HashMap::new(),
                default_max_wait_ms: None,
                estimate_overrides: HashMap::new(),
            }],
            memory: None,
            ratio_adjustment: RatioAdjustmentConfig::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15000,
            label: None,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingEstimateForDimension { dimension: "tokens", .. })
        ));
    }

    #[test]
    fn accepts_valid_single_model_config() {
        let mut models = HashMap::new();
        models.insert("alpha".to_string(), minimal_model());
        let cfg = SchedulerConfig {
            models,
            escalation_order: vec![],
            job_types: vec![],
            memory: None,
            ratio_adjustment: RatioAdjustmentConfig::default(),
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 15000,
            label: None,
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.effective_escalation_order(), vec!["alpha".to_string()]);
    }
}
