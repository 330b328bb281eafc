/// Caller-supplied options for a single connection attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Forwarded to the server as a `User-Agent` header (framed-socket) or
    /// auth payload field (multiplexed). Empty values are not sent.
    pub user_agent: Option<String>,
}
