//! `STAGENET_DEBUG_INFO=1` turns on per-stage debug logging for every graph in the process.

use std::sync::OnceLock;

const DEBUG_INFO_VAR: &str = "STAGENET_DEBUG_INFO";

fn flag_enabled(raw: Option<&str>) -> bool {
    raw.map(str::trim)
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

pub(crate) fn debug_info_forced() -> bool {
    static FORCED: OnceLock<bool> = OnceLock::new();
    *FORCED.get_or_init(|| flag_enabled(std::env::var(DEBUG_INFO_VAR).ok().as_deref()))
}
