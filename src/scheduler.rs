//! Job lifecycle: accept, escalate through the configured model order, wait, execute, record
//! actuals, release (component G).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::admission::AdmissionCore;
use crate::backend::{AcquireContext, Backend};
use crate::config::{JobTypeConfig, RatioConfig, SchedulerConfig};
use crate::coordinator::{Coordinator, SlotChangeCallback};
use crate::error::{ConfigError, SchedulerError};
use crate::job::{InstanceId, JobResult, Outcome, SlotChangeReason};
use crate::job_type::{estimate_inputs, JobTypeAllocator};
use crate::memory::MemoryGovernor;
use crate::model_limiter::{Actual, ModelLimiter, ReserveEstimate};
use crate::window::now_ms;

/// Per-job context handed to the user's job callback once a model has admitted it.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// the model that admitted this job
    pub model_id: String,
}

/// One unit of work submitted to [`Scheduler::queue_job`].
pub struct JobSpec<F> {
    /// a caller-assigned, stable job id (used only for logging/tracing)
    pub job_id: String,
    /// which job type this belongs to; `None` defaults to the sole configured type
    pub job_type_id: Option<String>,
    /// performs the actual work once admitted, returning what it actually consumed
    pub job: F,
}

/// Invoked with every [`crate::model_limiter::OverageEvent`] as it's recorded.
pub type OverageCallback = Box<dyn Fn(crate::model_limiter::OverageEvent) + Send + Sync>;

/// Builds and owns every limiter, allocator and coordination resource for one process.
pub struct Scheduler {
    config: SchedulerConfig,
    escalation_order: Vec<String>,
    job_types: Arc<HashMap<String, JobTypeConfig>>,
    model_limiters: Arc<HashMap<String, Arc<ModelLimiter>>>,
    admission: Arc<AdmissionCore>,
    coordinator: Arc<Coordinator>,
    backend: Arc<dyn Backend>,
    on_overage: OverageCallback,
    background_tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    active_jobs: dashmap::DashSet<String>,
}

impl Scheduler {
    /// Validate `config`, build every model limiter and job-type allocator, and prepare (but do
    /// not yet start) coordination with `backend`.
    pub fn new(config: SchedulerConfig, backend: Arc<dyn Backend>) -> Result<Self, ConfigError> {
        Self::with_callbacks(config, backend, Box::new(|_| {}), Box::new(|_| {}))
    }

    /// As [`Scheduler::new`], additionally wiring an overage callback (spec §6.4 `onOverage`).
    pub fn with_overage_callback(
        config: SchedulerConfig,
        backend: Arc<dyn Backend>,
        on_overage: OverageCallback,
    ) -> Result<Self, ConfigError> {
        Self::with_callbacks(config, backend, on_overage, Box::new(|_| {}))
    }

    /// As [`Scheduler::new`], wiring both the overage callback (spec §6.4 `onOverage`) and the
    /// slot-availability callback (spec §6.3 `onAvailableSlotsChange`). The latter fires with
    /// the reason a change occurred; current allocation detail is available via
    /// [`Scheduler::stats`] and [`Scheduler::allocation`].
    pub fn with_callbacks(
        config: SchedulerConfig,
        backend: Arc<dyn Backend>,
        on_overage: OverageCallback,
        on_slots_changed: SlotChangeCallback,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let memory_governor = config.memory.map(MemoryGovernor::new).map(Arc::new);

        let mut model_limiters = HashMap::new();
        for (model_id, model_config) in &config.models {
            let governor = if model_config.default_estimate.estimated_used_memory_kb.is_some() {
                memory_governor.clone()
            } else {
                None
            };
            model_limiters.insert(
                model_id.clone(),
                Arc::new(ModelLimiter::new(model_config, governor)),
            );
        }
        let model_limiters = Arc::new(model_limiters);

        let allocator = JobTypeAllocator::new(&config.job_types, config.ratio_adjustment)?;
        let admission = Arc::new(AdmissionCore::new(allocator));

        let mut job_types = HashMap::new();
        if config.job_types.is_empty() {
            job_types.insert(
                "default".to_string(),
                JobTypeConfig {
                    id: "default".to_string(),
                    ratio: RatioConfig {
                        initial_value: 1.0,
                        flexible: false,
                    },
                    max_wait_ms: HashMap::new(),
                    default_max_wait_ms: None,
                    estimate_overrides: HashMap::new(),
                },
            );
        } else {
            for jt in &config.job_types {
                job_types.insert(jt.id.clone(), jt.clone());
            }
        }

        let escalation_order = config.effective_escalation_order();
        let model_configs = Arc::new(config.models.clone());
        let job_types = Arc::new(job_types);

        let coordinator = Arc::new(Coordinator::new(
            InstanceId::generate(),
            backend.clone(),
            model_limiters.clone(),
            model_configs,
            job_types.clone(),
            admission.clone(),
            on_slots_changed,
            config.heartbeat_timeout_ms,
        ));

        Ok(Self {
            config,
            escalation_order,
            job_types,
            model_limiters,
            admission,
            coordinator,
            backend,
            on_overage,
            background_tasks: std::sync::Mutex::new(Vec::new()),
            active_jobs: dashmap::DashSet::new(),
        })
    }

    /// Register with the backend, begin receiving pool reallocations, and start the periodic
    /// heartbeat (spec §4.8) and fairness-ratio adjustment (spec §4.5) timers.
    pub async fn start(&self) {
        self.coordinator.start().await;

        let mut tasks = self.background_tasks.lock().expect("background task lock poisoned");

        let coordinator = self.coordinator.clone();
        let model_limiters = self.model_limiters.clone();
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await; // first tick fires immediately; we already registered above
            loop {
                ticker.tick().await;
                coordinator.heartbeat_tick().await;

                let any_reset = model_limiters.values().map(|l| l.poll_window_reset()).fold(false, |a, b| a || b);
                if any_reset {
                    coordinator.wake_and_notify(SlotChangeReason::WindowReset).await;
                }
            }
        }));

        let model_limiters = self.model_limiters.clone();
        let model_configs = self.config.models.clone();
        let job_types = self.job_types.clone();
        let admission = self.admission.clone();
        let coordinator = self.coordinator.clone();
        let ratio_interval = Duration::from_millis(self.config.ratio_adjustment.interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ratio_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (pools, estimates) =
                    snapshot_pools_and_estimates(&model_limiters, &model_configs, &job_types, &coordinator);
                let loads = admission.loads_by_job_type(&pools, &estimates);
                admission.allocator.adjust_ratios(&loads);
                coordinator.wake_and_notify(SlotChangeReason::Local).await;
            }
        }));
    }

    /// Leave the backend's coordinated pool, stop the background timers, and drain every wait
    /// queue.
    pub async fn stop(&self) {
        for task in self.background_tasks.lock().expect("background task lock poisoned").drain(..) {
            task.abort();
        }
        self.coordinator.stop().await;
        self.admission.stop().await;
    }

    /// This instance's id (spec §6.3 `getInstanceId`).
    pub fn instance_id(&self) -> &InstanceId {
        self.coordinator.instance_id()
    }

    /// The last-received distributed allocation (spec §6.3 `getAllocation`).
    pub fn allocation(&self) -> crate::backend::AllocationInfo {
        self.coordinator.allocation()
    }

    /// Per-model counter/concurrency/memory snapshots (spec §6.3 `getStats`).
    pub fn stats(&self) -> HashMap<String, crate::model_limiter::ModelStats> {
        self.model_limiters
            .iter()
            .map(|(id, limiter)| (id.clone(), limiter.stats()))
            .collect()
    }

    /// Job ids currently admitted and running (spec §6.3 `getActiveJobs`).
    pub fn active_jobs(&self) -> Vec<String> {
        self.active_jobs.iter().map(|id| (*id).clone()).collect()
    }

    /// Submit one job, escalating through the configured model order until one admits it or
    /// every model has been tried.
    pub async fn queue_job<F, Fut>(&self, spec: JobSpec<F>) -> Result<JobResult, SchedulerError>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<Outcome, String>>,
    {
        let job_type_id = match &spec.job_type_id {
            Some(id) => id.clone(),
            None => self
                .admission
                .allocator
                .sole_job_type()
                .map(str::to_string)
                .unwrap_or_else(|| "default".to_string()),
        };

        if !self.admission.allocator.contains(&job_type_id) {
            return Err(SchedulerError::UnknownJobType(job_type_id));
        }

        let job_type_config = self.job_types.get(&job_type_id);
        let mut models_tried = Vec::new();
        let mut job = Some(spec.job);

        for model_id in &self.escalation_order {
            models_tried.push(model_id.clone());

            let Some(model_limiter) = self.model_limiters.get(model_id) else {
                continue;
            };
            let model_config = &self.config.models[model_id];
            let pool = self.coordinator.pool_inputs(model_id, model_config);
            let estimate = estimate_inputs(&self.job_types, &job_type_id, model_id, model_config);
            let max_wait = self.resolve_max_wait(job_type_config, model_id);

            let reserve_estimate = ReserveEstimate {
                requests: estimate.estimated_requests,
                tokens: estimate.estimated_tokens,
                memory_kb: estimate.estimated_memory_kb,
            };

            let queue = self.admission.wait_queue_for(model_id, &job_type_id);
            let admission = self.admission.clone();
            let model_limiter_for_try = model_limiter.clone();
            let model_id_owned = model_id.clone();
            let job_type_id_owned = job_type_id.clone();

            let try_reserve = move || {
                admission
                    .try_reserve(
                        &model_id_owned,
                        &job_type_id_owned,
                        &model_limiter_for_try,
                        &pool,
                        &estimate,
                        reserve_estimate,
                    )
                    .ok()
            };

            let reservation = queue
                .wait_for_capacity(try_reserve, Duration::from_millis(max_wait))
                .await;

            let Some(reservation) = reservation else {
                debug!(model = %model_id, job_type = %job_type_id, "model did not admit, escalating");
                continue;
            };

            let ctx = AcquireContext {
                model_id: model_id.clone(),
                job_type_id: job_type_id.clone(),
                estimated_tokens: estimate.estimated_tokens,
                estimated_requests: estimate.estimated_requests,
            };
            if !self.backend.acquire(&ctx).await {
                self.admission.release(model_limiter, reservation, None);
                self.coordinator.wake_and_notify(SlotChangeReason::Local).await;
                debug!(model = %model_id, "backend rejected, escalating");
                continue;
            }

            let started_at = now_ms();
            self.active_jobs.insert(spec.job_id.clone());
            let job_fn = job.take().expect("job callback consumed at most once");
            let outcome = job_fn(JobContext {
                model_id: model_id.clone(),
            })
            .await;
            let completed_at = now_ms();
            self.active_jobs.remove(&spec.job_id);

            self.backend.release(&ctx).await;

            return match outcome {
                Ok(outcome) => {
                    let actual = Actual {
                        requests: outcome.request_count,
                        tokens: outcome.usage.total_tokens(),
                    };
                    let overages = self.admission.release(model_limiter, reservation, Some(actual));
                    self.coordinator.wake_and_notify(SlotChangeReason::Local).await;
                    for overage in overages {
                        (self.on_overage)(overage);
                    }
                    Ok(JobResult {
                        model_used: model_id.clone(),
                        request_count: outcome.request_count,
                        usage: outcome.usage,
                        started_at,
                        completed_at,
                        models_tried,
                    })
                }
                Err(message) => {
                    self.admission.release(model_limiter, reservation, None);
                    self.coordinator.wake_and_notify(SlotChangeReason::Local).await;
                    Err(SchedulerError::JobExecution(message))
                }
            };
        }

        warn!(job_id = %spec.job_id, job_type = %job_type_id, "all models rejected");
        Err(SchedulerError::AdmissionRejected { models_tried })
    }

    fn resolve_max_wait(&self, job_type_config: Option<&JobTypeConfig>, model_id: &str) -> u64 {
        if let Some(jt) = job_type_config {
            if let Some(ms) = jt.max_wait_ms.get(model_id) {
                return *ms;
            }
            if let Some(ms) = jt.default_max_wait_ms {
                return ms;
            }
        }

        let now = now_ms();
        let seconds_into_minute = (now / 1_000) % 60;
        let remaining_seconds = 60i64 - seconds_into_minute as i64 + 5;
        (remaining_seconds.max(0) as u64) * 1_000
    }
}

/// Recompute every (model, jobType) pool/estimate pair, the input to a ratio-adjustment cycle.
fn snapshot_pools_and_estimates(
    model_limiters: &HashMap<String, Arc<ModelLimiter>>,
    model_configs: &HashMap<String, crate::config::ModelConfig>,
    job_types: &HashMap<String, JobTypeConfig>,
    coordinator: &Coordinator,
) -> (
    HashMap<String, crate::job_type::PoolInputs>,
    HashMap<(String, String), crate::job_type::EstimateInputs>,
) {
    let mut pools = HashMap::new();
    let mut estimates = HashMap::new();

    for (model_id, model_config) in model_configs {
        if !model_limiters.contains_key(model_id) {
            continue;
        }
        pools.insert(model_id.clone(), coordinator.pool_inputs(model_id, model_config));
        for job_type_id in job_types.keys() {
            estimates.insert(
                (model_id.clone(), job_type_id.clone()),
                estimate_inputs(job_types, job_type_id, model_id, model_config),
            );
        }
    }

    (pools, estimates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, ModelQuota};
    use crate::config::{MemoryConfig, ModelConfig, ResourceEstimate};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn cfg(rpm: u64, tpm: u64) -> SchedulerConfig {
        let mut models = HashMap::new();
        models.insert(
            "alpha".to_string(),
            ModelConfig {
                requests_per_minute: Some(rpm),
                tokens_per_minute: Some(tpm),
                requests_per_day: None,
                tokens_per_day: None,
                max_concurrent_requests: None,
                default_estimate: ResourceEstimate {
                    estimated_number_of_requests: 1,
                    estimated_used_tokens: 10,
                    estimated_used_memory_kb: None,
                },
            },
        );
        SchedulerConfig {
            models,
            escalation_order: vec![],
            job_types: vec![],
            memory: None,
            ratio_adjustment: Default::default(),
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            label: None,
        }
    }

    fn quotas(rpm: u64, tpm: u64) -> HashMap<String, ModelQuota> {
        let mut m = HashMap::new();
        m.insert(
            "alpha".to_string(),
            ModelQuota {
                requests_per_minute: Some(rpm),
                tokens_per_minute: Some(tpm),
                requests_per_day: None,
                tokens_per_day: None,
                total_slots: None,
            },
        );
        m
    }

    #[tokio::test]
    async fn job_runs_and_returns_actuals() {
        init_tracing();
        let backend = Arc::new(MemoryBackend::new(quotas(10, 100)));
        let scheduler = Scheduler::new(cfg(10, 100), backend).unwrap();
        scheduler.start().await;

        let result = scheduler
            .queue_job(JobSpec {
                job_id: "job-1".to_string(),
                job_type_id: None,
                job: |_ctx| async {
                    Ok(Outcome {
                        request_count: 1,
                        usage: crate::job::Usage {
                            input: 5,
                            output: 3,
                            cached: 0,
                        },
                    })
                },
            })
            .await
            .unwrap();

        assert_eq!(result.model_used, "alpha");
        assert_eq!(result.usage.total_tokens(), 8);
        assert_eq!(result.models_tried, vec!["alpha".to_string()]);
        assert!(scheduler.active_jobs().is_empty(), "job should be cleared on completion");
    }

    #[tokio::test]
    async fn rejects_unknown_job_type() {
        let backend = Arc::new(MemoryBackend::new(quotas(10, 100)));
        let scheduler = Scheduler::new(cfg(10, 100), backend).unwrap();

        let result = scheduler
            .queue_job(JobSpec {
                job_id: "job-1".to_string(),
                job_type_id: Some("ghost".to_string()),
                job: |_ctx| async {
                    Ok(Outcome {
                        request_count: 1,
                        usage: Default::default(),
                    })
                },
            })
            .await;

        assert!(matches!(result, Err(SchedulerError::UnknownJobType(_))));
    }

    #[tokio::test]
    async fn escalation_on_exhaustion() {
        init_tracing();
        let mut cfg = cfg(1, 1_000);
        cfg.models.insert(
            "beta".to_string(),
            ModelConfig {
                requests_per_minute: Some(100),
                tokens_per_minute: Some(1_000),
                requests_per_day: None,
                tokens_per_day: None,
                max_concurrent_requests: None,
                default_estimate: ResourceEstimate {
                    estimated_number_of_requests: 1,
                    estimated_used_tokens: 10,
                    estimated_used_memory_kb: None,
                },
            },
        );
        cfg.escalation_order = vec!["alpha".to_string(), "beta".to_string()];
        cfg.job_types = vec![JobTypeConfig {
            id: "default".to_string(),
            ratio: RatioConfig {
                initial_value: 1.0,
                flexible: false,
            },
            max_wait_ms: HashMap::from([("alpha".to_string(), 0)]),
            default_max_wait_ms: None,
            estimate_overrides: HashMap::new(),
        }];

        let mut quotas = quotas(1, 1_000);
        quotas.insert(
            "beta".to_string(),
            ModelQuota {
                requests_per_minute: Some(100),
                tokens_per_minute: Some(1_000),
                requests_per_day: None,
                tokens_per_day: None,
                total_slots: None,
            },
        );
        let backend = Arc::new(MemoryBackend::new(quotas));
        let scheduler = Scheduler::new(cfg, backend).unwrap();
        scheduler.start().await;

        let make_job = || {
            |_ctx: JobContext| async {
                Ok(Outcome {
                    request_count: 1,
                    usage: crate::job::Usage {
                        input: 10,
                        output: 0,
                        cached: 0,
                    },
                })
            }
        };

        let first = scheduler
            .queue_job(JobSpec {
                job_id: "job-1".to_string(),
                job_type_id: None,
                job: make_job(),
            })
            .await
            .unwrap();
        assert_eq!(first.model_used, "alpha");

        let second = scheduler
            .queue_job(JobSpec {
                job_id: "job-2".to_string(),
                job_type_id: None,
                job: make_job(),
            })
            .await
            .unwrap();
        assert_eq!(second.model_used, "beta");
        assert_eq!(second.models_tried, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn memory_config_requires_an_estimate() {
        let mut c = cfg(10, 100);
        c.memory = Some(MemoryConfig {
            free_memory_ratio: 0.5,
            recalculation_interval_ms: 1_000,
            max_memory_kb: None,
            min_capacity: None,
            max_capacity: None,
        });
        assert!(c.validate().is_err());
    }
}
