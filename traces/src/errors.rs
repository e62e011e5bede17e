use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TracesError {
    #[error("span export needs a running tokio runtime")]
    MissingRuntime,

    #[error("the `{0}` exporter is not compiled in, enable its cargo feature")]
    InvalidFeaturesError(&'static str),

    #[error("otlp access key is not a valid metadata value")]
    InvalidAccessKey,

    #[error("failure to install the exporter `{0}`")]
    ExporterProviderError(String),
}
