//! Version information for waitroom.

/// Waitroom version from Cargo.toml
pub const WAITROOM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent sent with every admission request.
pub fn user_agent() -> String {
    format!("waitroom/{}", WAITROOM_VERSION)
}
