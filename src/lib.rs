pub mod app;
pub mod call;
pub mod config;
pub mod handler;
pub mod media;
pub mod provider;
pub mod realtime;
pub mod stream;
pub mod tool;
pub mod tunnel;
pub mod version;

/// Milliseconds since the Unix epoch.
pub fn get_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
