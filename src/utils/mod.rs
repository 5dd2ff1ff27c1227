/// Utility functions and helpers
use std::io;
use std::net::IpAddr;
use std::time::Duration;

/// Resolve a backend host to an IP address, via DNS when it is not already a literal
pub async fn resolve_host_ip(host: &str) -> io::Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {}", host),
            )
        })
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{}ms", millis);
    }

    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
