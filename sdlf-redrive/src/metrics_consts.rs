pub const RUN_STARTS: &str = "sdlf_redrive_run_starts";
pub const RUN_TIME: &str = "sdlf_redrive_total_run_ms";
pub const RUN_ENDS: &str = "sdlf_redrive_run_ends";

pub const REDRIVEN: &str = "sdlf_redrive_messages_total";
pub const REDRIVE_ERRORS: &str = "sdlf_redrive_errors_total";
pub const DISCARDED: &str = "sdlf_redrive_discarded_total";

// Measured before each redrive, so a stuck DLQ shows up without reading it
pub const DLQ_DEPTH: &str = "sdlf_dlq_depth";
