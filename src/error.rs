use thiserror::Error;

#[derive(Error, Debug)]
pub enum ErrorWrapper {
    #[error("zenoh error {0:?}")]
    ZenohError(zenoh::Error),
}
