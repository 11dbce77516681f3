// ABOUTME: Engine-agnostic coordination primitives for the luabot chat host
// ABOUTME: Event model, callback registry, main/worker lanes, log relay, schedules and options

pub mod backoff;
pub mod config;
pub mod coord;
pub mod event;
pub mod log_relay;
pub mod metrics;
pub mod registry;
pub mod schedule;

pub use backoff::{ReconnectPolicy, ReconnectState};
pub use config::{BackendKind, CommonClientOption, ConfigError, CronEntry, HttpsOption};
pub use coord::{CoordError, CoordMessage, Coordinator, Lane, ReplyHandle};
pub use event::{InboundEvent, MessageEvent, TransportSignal};
pub use log_relay::{LogLevel, LogRecord, LogRelay, LogSink, Logger, TracingSink};
pub use registry::CallbackRegistry;
pub use schedule::CronSchedule;
