//! ---
//! lb_section: "03-logging-metrics"
//! lb_subsection: "module"
//! lb_type: "source"
//! lb_scope: "code"
//! lb_description: "bus_* logging macros carrying station context."
//! lb_version: "v0.1.0"
//! lb_owner: "line-controls"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __bus_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            station = ctx.station.unwrap_or(""),
            signal = ctx.signal.unwrap_or(""),
            address = ctx.address.unwrap_or(""),
            tick = ctx.tick.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with station context.
#[macro_export]
macro_rules! bus_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__bus_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__bus_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with station context.
#[macro_export]
macro_rules! bus_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__bus_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__bus_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with station context.
#[macro_export]
macro_rules! bus_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__bus_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__bus_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with station context.
#[macro_export]
macro_rules! bus_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__bus_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__bus_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
