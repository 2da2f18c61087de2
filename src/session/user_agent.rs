//! User-Agent assembly for upload requests.

/// Build the session's User-Agent value.
///
/// The format is `<os>-<arch>;rust-<version>;agent-<version>;<ssl token>;`
/// where the ssl token records whether server certificate verification is
/// active.
pub(crate) fn build(agent_version: &str, certificate_verification: bool) -> String {
    let ssl_token = if certificate_verification {
        "ssllib"
    } else {
        "nossllib"
    };
    format!(
        "{}-{};rust-{};agent-{};{};",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_RUST_VERSION"),
        agent_version,
        ssl_token
    )
}
