#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed message")]
    MalformedMessage,
}

pub type Result<T> = std::result::Result<T, Error>;
