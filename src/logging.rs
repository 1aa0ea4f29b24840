//! Replay-aware logging for orchestration code.
//!
//! Orchestrations re-run from the start of their execution on every turn; these
//! macros only emit while the engine is past recorded history, so each line is
//! logged once per instance rather than once per replay.
//!
//! ```rust,ignore
//! durable_info!(ctx, step = "reply", "sending reply for seq {}", seq);
//! ```

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(target: "duralane::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(target: "duralane::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(target: "duralane::orchestration", instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}
