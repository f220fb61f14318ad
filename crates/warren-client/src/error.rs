#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to dial manager at {addr}: {source}")]
    ManagerDial { addr: String, #[source] source: std::io::Error },

    #[error("failed to dial relay at {addr}: {source}")]
    RelayDial { addr: String, #[source] source: std::io::Error },
}
