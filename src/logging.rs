//! Kernel-style logging macros routed through a pluggable sink.
//!
//! The embedding kernel installs whatever sink it wants (serial, log file,
//! terminal); until then log lines are dropped. Drivers tag messages with
//! their module type so the origin shows up in the line prefix.

use core::fmt::Arguments;

use spin::Once;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, module: Option<&str>, args: Arguments);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

/// Installs the global log sink. Only the first call wins.
pub fn set_sink(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

#[doc(hidden)]
pub fn _log(level: LogLevel, module: Option<&str>, args: Arguments) {
    if let Some(sink) = SINK.get() {
        sink.log(level, module, args);
    }
}

/// Runtime debug info, optionally tagged with the reporting module's type.
#[macro_export]
macro_rules! debug {
    ($mod: ty, $($arg:tt)*) => {{
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logging::_log(
            $crate::logging::LogLevel::Debug,
            Some(stringify!($mod)),
            format_args!($($arg)*),
        )
    }};
    ($($arg:tt)*) => {
        $crate::logging::_log($crate::logging::LogLevel::Debug, None, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logging::_log($crate::logging::LogLevel::Info, None, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logging::_log(
            $crate::logging::LogLevel::Warn,
            Some(stringify!($mod)),
            format_args!($($arg)*),
        )
    }};
    ($($arg:tt)*) => {
        $crate::logging::_log($crate::logging::LogLevel::Warn, None, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logging::_log(
            $crate::logging::LogLevel::Error,
            Some(stringify!($mod)),
            format_args!($($arg)*),
        )
    }};
    ($($arg:tt)*) => {
        $crate::logging::_log($crate::logging::LogLevel::Error, None, format_args!($($arg)*))
    };
}
