//! HTTP request logging middleware

/// Log each request with its status and timing
pub fn with_request_logging() -> warp::filters::log::Log<impl Fn(warp::filters::log::Info) + Clone> {
    warp::log::custom(|info| {
        let status = info.status();
        let status_icon = match status.as_u16() {
            200..=299 => "✅",
            300..=399 => "🔀",
            400..=499 => "⚠️",
            500..=599 => "❌",
            _ => "❓",
        };

        let elapsed_ms = info.elapsed().as_millis();
        let timing_icon = if elapsed_ms > 60_000 {
            "🐌" // builds and full backups
        } else if elapsed_ms > 1000 {
            "⏳"
        } else {
            "⚡"
        };

        let remote_addr = info
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let line = format!(
            "{} {} {} {} - {} {}ms - {}",
            status_icon,
            timing_icon,
            info.method(),
            info.path(),
            status,
            elapsed_ms,
            remote_addr
        );
        if status.is_server_error() {
            log::error!("{}", line);
        } else if status.is_client_error() {
            log::warn!("{}", line);
        } else {
            log::info!("{}", line);
        }
    })
}
