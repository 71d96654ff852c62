//! Version information for easel.

/// Easel version from Cargo.toml
pub const EASEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent sent with every outbound request.
pub fn user_agent() -> String {
    format!("easel/{}", EASEL_VERSION)
}
