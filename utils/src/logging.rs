// Category-based logging infrastructure
//
// This will be used from multiple threads, so it needs
// to be stateless

#[allow(dead_code, non_camel_case_types)]
pub enum LogLevel {
    // in order of highest priority
    critical, // Urgent and must always be displayed
    error,
    debug,     // debugging related, fairly verbose
    verbose,   // more verbose debug output
    info,      // most verbose
    profiling, // profiling related timing, absurdly verbose
}

impl LogLevel {
    pub fn get_name(&self) -> &'static str {
        match self {
            LogLevel::critical => "critical",
            LogLevel::error => "error",
            LogLevel::debug => "debug",
            LogLevel::verbose => "verbose",
            LogLevel::info => "info",
            LogLevel::profiling => "profiling",
        }
    }

    pub fn get_level(&self) -> u32 {
        match self {
            LogLevel::critical => 0,
            LogLevel::error => 1,
            LogLevel::debug => 2,
            LogLevel::verbose => 3,
            LogLevel::info => 4,
            LogLevel::profiling => 5,
        }
    }
}

#[macro_export]
macro_rules! debug {
    ($($format_args:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::log_internal!($crate::logging::LogLevel::debug, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! verbose {
    ($($format_args:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::log_internal!($crate::logging::LogLevel::verbose, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! profiling {
    ($($format_args:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::log_internal!($crate::logging::LogLevel::profiling, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! info {
    ($($format_args:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::log_internal!($crate::logging::LogLevel::info, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! error {
    ($($format_args:tt)+) => {{
        $crate::log_internal!($crate::logging::LogLevel::error, $($format_args)+)
    }};
}

#[allow(unused_macros)]
#[macro_export]
macro_rules! log_internal{
    ($loglevel:expr, $($format_args:tt)+) => ({

        lazy_static::lazy_static! {
            static ref DEFAULT_LEVEL: u32 = $crate::logging::LogLevel::error.get_level();

            static ref LOG_LEVEL_RAW: u32 = match std::env::var("STRATUS_LOG") {
                Ok(val) => match val.as_str() {
                    "debug" => $crate::logging::LogLevel::debug.get_level(),
                    "verbose" => $crate::logging::LogLevel::verbose.get_level(),
                    "info" => $crate::logging::LogLevel::info.get_level(),
                    _ => *DEFAULT_LEVEL,
                },
                Err(_) => *DEFAULT_LEVEL,
            };
        }

        let level = $loglevel;
        let is_err = level.get_level() <= *DEFAULT_LEVEL;
        let mut should_log = level.get_level() <= *LOG_LEVEL_RAW;

        // If this variable is defined check that our log statements
        // come from files that contain this string
        if let Ok(m) = std::env::var("STRATUS_LOG_MATCH") {
            should_log = should_log && file!().contains(m.as_str());
        }

        // If it is an error or our conditions are met then log it
        if is_err || should_log {
            println!("[{:?}]<{}> {}:{} - {}",
                $crate::timing::get_current_millis(),
                level.get_name(),
                file!(),
                line!(),
                format!($($format_args)+)
            );
        }
    })
}
