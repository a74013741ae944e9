use indicatif::{ProgressBar, ProgressStyle};

/// Join a mirror base URL and a path inside the mirror tree.
///
/// 无论 base 是否以 '/' 结尾、path 是否以 '/' 开头, 都只保留一个分隔符
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Recover the mirror base from a redirect target that points at `path`.
///
/// Returns `None` when the target does not end with the known path, in which
/// case the redirect cannot be mapped back onto a mirror root.
pub fn strip_known_path(location: &str, path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');
    let base = location.strip_suffix(path)?;
    if base.is_empty() {
        return None;
    }
    Some(base.trim_end_matches('/').to_string())
}

/// Progress bar for per-mirror work. Hidden when `visible` is false.
pub fn progress_bar(len: usize, message: &'static str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(len as u64);
    // 模板是常量, 解析失败时退回默认样式
    if let Ok(style) = ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos}/{len} {msg}") {
        pb.set_style(style.progress_chars("|| "));
    }
    pb.set_message(message);
    pb
}

/// Bits per second rendered as Mbit/s for tables and logs.
pub fn format_speed(bits_per_sec: Option<u64>) -> String {
    match bits_per_sec {
        Some(bps) => format!("{:.2} Mbit/s", bps as f64 / 1_000_000.0),
        None => "-".to_string(),
    }
}
