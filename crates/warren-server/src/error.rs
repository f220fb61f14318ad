/// Errors raised by the process boundary (listener bind failures). Link-level
/// errors (parse, auth) stay inside `warren_core` and never reach here — they
/// are logged and contained at the link that produced them.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind manager listener on {addr}: {source}")]
    ManagerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind relay listener on {addr}: {source}")]
    RelayBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
