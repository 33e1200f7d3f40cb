mod domains;
mod message;
mod rate;
mod sandbox;

pub use domains::*;
pub use message::*;
pub use rate::*;
pub use sandbox::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] rocksdb::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("unknown bucket {0}")]
    UnknownBucket(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("AWS cryptographic error {0}")]
    AwsCrypto(#[from] aws_lc_rs::error::Unspecified),
    #[error("AWS cryptographic key rejected {0}")]
    WrongCryptKey(#[from] aws_lc_rs::error::KeyRejected),
    #[error("email authentication error {0}")]
    MailAuth(#[from] mail_auth::Error),
    #[error("could not read key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}
