//! System-wide constants and configuration defaults.

// Queue naming
/// Shared queue that workers consume task requests from.
pub const TASK_QUEUE: &str = "agent.tasks";
/// Shared queue that non-streaming results are published to, keyed by correlation id.
pub const RESULT_QUEUE: &str = "agent.results";
/// Prefix for the per-task stream queues (`stream:<task_id>`).
pub const STREAM_QUEUE_PREFIX: &str = "stream:";
/// Suffix appended to a queue name to form its dead-letter companion.
pub const DLQ_SUFFIX: &str = ":dlq";

// Worker pool
/// Default number of task workers.
pub const DEFAULT_WORKERS: usize = 10;
/// How long a worker blocks on the task queue before re-checking shutdown.
pub const CONSUME_POLL_TIMEOUT_MS: u64 = 1000;

// Janitor
/// Default janitor sweep period.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
/// Default idle threshold after which an instance is reclaimed.
pub const DEFAULT_INSTANCE_TIMEOUT_SECS: u64 = 7200;
/// How long unclaimed results stay in the result queue before the janitor purges them.
pub const RESULT_RETENTION_SECS: u64 = 300;

// Conversation context
/// Default per-session message cap.
pub const DEFAULT_MAX_HISTORY: usize = 100;
/// History is never trimmed below this many messages.
pub const HISTORY_FLOOR: usize = 1;

// Task execution
/// Default per-task deadline.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

// Message queue
/// Default bounded capacity of the task queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
/// Default per-stream chunk buffer.
pub const DEFAULT_STREAM_QUEUE_SIZE: usize = 128;
/// Retries for a message before it moves to the dead-letter queue.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Base delay for exponential backoff on transient publish failures.
pub const RETRY_BASE_DELAY_MS: u64 = 100;
/// Cap for the exponential backoff delay.
pub const RETRY_MAX_DELAY_MS: u64 = 10_000;
/// Pause between publish attempts when a stream consumer is slow.
pub const STREAM_BACKPRESSURE_DELAY_MS: u64 = 50;

// API
/// Default bind host for the HTTP server.
pub const DEFAULT_API_HOST: &str = "127.0.0.1";
/// Default bind port for the HTTP server.
pub const DEFAULT_API_PORT: u16 = 8080;
