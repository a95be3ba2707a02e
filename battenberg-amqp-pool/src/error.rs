/// Pool error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl From<battenberg_amqp::TransportError> for Error {
    fn from(err: battenberg_amqp::TransportError) -> Self {
        Self(err.into())
    }
}
