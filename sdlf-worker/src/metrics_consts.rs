pub const BATCH_POLLS: &str = "sdlf_worker_batch_polls_total";
pub const BATCH_BELOW_THRESHOLD: &str = "sdlf_worker_batch_below_threshold_total";
pub const BATCHES_STARTED: &str = "sdlf_worker_batches_started_total";
pub const BATCH_KEYS: &str = "sdlf_worker_batch_keys_total";
pub const BATCH_ERRORS: &str = "sdlf_worker_batch_errors_total";
pub const BATCH_TIME: &str = "sdlf_worker_batch_ms";

pub const DLQ_WRITES: &str = "sdlf_worker_dlq_writes_total";
pub const DLQ_WRITE_ERRORS: &str = "sdlf_worker_dlq_write_errors_total";

pub const RUNS_CLAIMED: &str = "sdlf_worker_runs_claimed_total";
pub const EXECUTIONS_SUCCEEDED: &str = "sdlf_worker_executions_succeeded_total";
pub const EXECUTIONS_FAILED: &str = "sdlf_worker_executions_failed_total";
pub const RUN_TIME: &str = "sdlf_worker_run_ms";
pub const RUN_FINISH_ERRORS: &str = "sdlf_worker_run_finish_errors_total";
pub const RUNS_RESET: &str = "sdlf_worker_stalled_runs_reset_total";
pub const RUNS_STALLED: &str = "sdlf_worker_stalled_runs_failed_total";
pub const JOB_POLLS: &str = "sdlf_worker_job_status_polls_total";
pub const NEXT_STAGE_MESSAGES: &str = "sdlf_worker_next_stage_messages_total";
