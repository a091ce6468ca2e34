#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("Not enough bytes")]
    NotEnoughData { actual: usize, minimum: usize },

    /// A segment disagrees with the geometry or id of the image it belongs to.
    #[error("segment contract violation: {0}")]
    SegmentContract(String),

    #[error("invalid expression at {pos}: {message}")]
    Expression { pos: usize, message: String },

    #[error("no such channel: {0}")]
    NoSuchChannel(String),
    #[error("duplicate channel: {0}")]
    DuplicateChannel(String),

    /// Composite could not be produced; the source product is untouched.
    #[error("composite error: {0}")]
    Composite(String),
    #[error("invalid lut: {0}")]
    Lut(String),
}

pub type Result<T> = std::result::Result<T, Error>;
