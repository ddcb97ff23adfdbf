mod event;
pub use event::{newest, Event};

mod filter;
pub use filter::Filter;

mod pubkey;
pub use pubkey::Pubkey;

pub mod wire;

mod conn;
pub use conn::SubMessage;

mod pool;
pub use pool::{PoolConfig, RelayPool, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid relay URL: '{0}'")]
    InvalidUrl(String),
    #[error(transparent)]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("malformed public key")]
    InvalidPubkey,
    #[error("{0}")]
    Protocol(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
