use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    #[snafu(display("coach API base URL is empty"))]
    MissingBaseUrl { stage: &'static str },
    #[snafu(display("failed to build HTTP client on `{stage}`"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
}
