use super::constants::*;

pub(crate) fn log_level() -> Option<String> {
    Some(LOG_LEVEL.to_string())
}

pub(crate) fn request_timeout_secs() -> u64 {
    REQUEST_TIMEOUT_SECS
}

pub(crate) fn transport() -> String {
    "stdio".to_string()
}

pub(crate) fn default_true() -> bool {
    true
}
