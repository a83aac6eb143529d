// Logging macros forwarding to `Logger::*_args` with a level check up front,
// so disabled levels never format their arguments.

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {{
        if ::log::log_enabled!(::log::Level::Debug) {
            ($logger).debug_args(format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {{
        if ::log::log_enabled!(::log::Level::Info) {
            ($logger).info_args(format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {{
        if ::log::log_enabled!(::log::Level::Warn) {
            ($logger).warn_args(format_args!($($arg)*));
        }
    }}
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {{
        if ::log::log_enabled!(::log::Level::Error) {
            ($logger).error_args(format_args!($($arg)*));
        }
    }}
}

/// Build a `HashMap<String, _>` from `key => value` pairs.
///
/// ```
/// use wiring_common::hmap;
/// let props = hmap!("zone" => "z1", "node" => "a");
/// assert_eq!(props.get("zone").map(|v| *v), Some("z1"));
/// ```
#[macro_export]
macro_rules! hmap {
    {} => {
        {
            let map: ::std::collections::HashMap<String, _> = ::std::collections::HashMap::new();
            map
        }
    };
    { $($key:expr => $value:expr),* $(,)? } => {
        {
            let mut map = ::std::collections::HashMap::new();
            $(map.insert($key.to_string(), $value);)*
            map
        }
    };
}
