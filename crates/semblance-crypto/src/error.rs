use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("signing key too short: {actual} bytes, need at least {minimum}")]
    KeyTooShort { actual: usize, minimum: usize },

    #[error("signing key is not valid hex")]
    InvalidKeyEncoding,
}
