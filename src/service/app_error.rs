// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// transport errors
    #[error("tls error: {0}")]
    TlsError(String),

    #[error("certificate error: {0}")]
    CertificateError(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("peer {0} is banned")]
    PeerBanned(String),

    #[error("connection limit of {0} reached")]
    RegistryFull(usize),

    #[error("tracing setup error: {0}")]
    TracingError(String),
}

impl From<rustls::Error> for AppError {
    fn from(value: rustls::Error) -> Self {
        AppError::TlsError(value.to_string())
    }
}

impl From<rcgen::Error> for AppError {
    fn from(value: rcgen::Error) -> Self {
        AppError::CertificateError(value.to_string())
    }
}

impl From<tracing::subscriber::SetGlobalDefaultError> for AppError {
    fn from(value: tracing::subscriber::SetGlobalDefaultError) -> Self {
        AppError::TracingError(value.to_string())
    }
}
