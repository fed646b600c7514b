/// Errors from a [`StateMirror`](crate::StateMirror).
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mirror API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("mirror unavailable: {0}")]
    Unavailable(String),
}
