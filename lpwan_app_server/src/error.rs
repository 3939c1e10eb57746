//! All errors used in the application server.

use aide::OperationOutput;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nom::error::{FromExternalError, ParseError};
use nom::ErrorConvert;
use serde::Serialize;
use thiserror::Error;
use tonic::Code;

/// Errors occurring when parsing LoRaWAN identifiers and keys.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoRaWanTypeError {
    /// Input has the wrong amount of bytes.
    #[error("Expected {expected} bytes, got {got}")]
    WrongLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },
    /// Input is no valid hex.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Errors returned by the storage layer.
///
/// The unit variants are sentinels with a fixed gRPC code, see [`StorageError::code`].
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object does not exist.
    #[error("object does not exist")]
    DoesNotExist,
    /// Object already exists.
    #[error("object already exists")]
    AlreadyExists,
    /// Name contains invalid characters.
    #[error("invalid name (it must only contain letters, numbers, underscores and dashes)")]
    InvalidName,
    /// Gateway discovery is enabled without an interval.
    #[error("invalid gateway-discovery interval, it must be greater than 0")]
    InvalidGatewayDiscoveryInterval,
    /// Referenced object does not exist.
    #[error("invalid foreign key, referenced object does not exist")]
    InvalidForeignKey,
    /// McGroupID out of range.
    #[error("invalid McGroupID, it must be between 0 and 3")]
    InvalidMcGroupId,
    /// FragIndex out of range.
    #[error("invalid FragIndex, it must be between 0 and 3")]
    InvalidFragIndex,
    /// A session parameter does not fit into its command field.
    #[error("invalid {field}, it must be between {min} and {max}")]
    OutOfRange {
        /// Name of the field.
        field: &'static str,
        /// Lowest valid value.
        min: i64,
        /// Highest valid value.
        max: i64,
    },
    /// Sqlx error.
    #[error("Database error from sqlx: {0}")]
    Sqlx(sqlx::Error),
    /// Migration error.
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::DoesNotExist,
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23505") => StorageError::AlreadyExists,
                Some("23503") => StorageError::InvalidForeignKey,
                _ => StorageError::Sqlx(err),
            },
            _ => StorageError::Sqlx(err),
        }
    }
}

impl StorageError {
    /// The gRPC code of the error. Errors without a sentinel map to [`Code::Unknown`].
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            StorageError::DoesNotExist => Code::NotFound,
            StorageError::AlreadyExists => Code::AlreadyExists,
            StorageError::InvalidName
            | StorageError::InvalidGatewayDiscoveryInterval
            | StorageError::InvalidMcGroupId
            | StorageError::InvalidFragIndex
            | StorageError::OutOfRange { .. } => Code::InvalidArgument,
            StorageError::InvalidForeignKey => Code::FailedPrecondition,
            StorageError::Sqlx(_) | StorageError::Migrate(_) => Code::Unknown,
        }
    }
}

/// Errors returned by the application layer command parsers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandParserError {
    /// The command identifier is not known for the port.
    #[error("Unknown CID: {cid:#04x}")]
    UnknownCid {
        /// The CID.
        cid: u8,
    },
    /// The payload ended in the middle of a command.
    #[error("Payload is truncated")]
    Truncated,
    /// Nom error.
    #[error("Nom encountered an error: {0:?}")]
    Nom(nom::error::ErrorKind),
}

impl ErrorConvert<CommandParserError> for CommandParserError {
    fn convert(self) -> CommandParserError {
        self
    }
}

impl<I> ParseError<I> for CommandParserError {
    fn from_error_kind(_: I, kind: nom::error::ErrorKind) -> Self {
        match kind {
            nom::error::ErrorKind::Eof => CommandParserError::Truncated,
            kind => CommandParserError::Nom(kind),
        }
    }

    fn append(_: I, _: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl FromExternalError<&[u8], CommandParserError> for CommandParserError {
    fn from_external_error(_: &[u8], _: nom::error::ErrorKind, e: CommandParserError) -> Self {
        e
    }
}

/// Type alias for command parsing.
pub type IResult<I, O> = nom::IResult<I, O, CommandParserError>;

/// Errors occurring in the fragmentation and multicast setup application layer.
#[derive(Error, Debug)]
pub enum ApplayerError {
    /// Command parser error.
    #[error("Command parser error: {0}")]
    CommandParser(#[from] CommandParserError),
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    /// Enqueueing the downlink failed.
    #[error("Enqueue error: {0}")]
    Enqueue(#[from] lpwan_grpc_clients::error::Error),
    /// A device answered with error flags set.
    #[error("{command} contains errors: {flags}")]
    AnswerFlags {
        /// The answer command.
        command: &'static str,
        /// The set error flags.
        flags: String,
    },
    /// A stored value does not fit into the command field.
    #[error("{field} is out of range: {value}")]
    OutOfRange {
        /// The field name.
        field: &'static str,
        /// The value.
        value: i64,
    },
}

/// Errors occurring when sending or receiving gateway pings.
#[derive(Error, Debug)]
pub enum GatewayPingError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    /// MQTT runtime error.
    #[error("MQTT runtime error: {0}")]
    Runtime(#[from] chirpstack_mqtt_integration::error::RuntimeError),
    /// Downlink creation error.
    #[error("Downlink error: {0}")]
    Downlink(#[from] chirpstack_mqtt_integration::error::DownlinkError),
    /// The configured data rate is not known.
    #[error("Data rate error: {0}")]
    DataRate(#[from] chirpstack_mqtt_integration::error::DataRateConversionError),
    /// The gateway MAC is not a valid EUI.
    #[error("Gateway ID error: {0}")]
    GatewayId(#[from] LoRaWanTypeError),
    /// The configured frequency is negative.
    #[error("Invalid ping frequency: {0}")]
    Frequency(i32),
}

/// Errors occurring while distributing bonuses.
#[derive(Error, Debug)]
pub enum BonusError {
    /// HTTP error.
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    /// The login returned no token.
    #[error("login returned an empty jwt")]
    EmptyJwt,
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    /// No organization for the user.
    #[error("the user does not exist or doesn't have an organization")]
    NoOrganization,
    /// The token is not known.
    #[error("unknown token: {token}")]
    UnknownToken {
        /// The token of the airdrop.
        token: String,
    },
    /// m2m server error.
    #[error("m2m error: {0}")]
    M2m(#[from] lpwan_grpc_clients::error::Error),
}

/// Errors occurring during authentication and authorization.
#[derive(Error, Debug)]
pub enum AuthError {
    /// No token was supplied.
    #[error("authentication failed: no authorization token")]
    MissingToken,
    /// Token validation failed.
    #[error("authentication failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    /// The user of the token does not exist.
    #[error("authentication failed: unknown user")]
    UnknownUser,
    /// The user is not active.
    #[error("authentication failed: inactive user")]
    InactiveUser,
    /// The user is not allowed to access the resource.
    #[error("permission denied")]
    PermissionDenied,
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AuthError {
    /// The gRPC code of the error.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            AuthError::MissingToken
            | AuthError::Jwt(_)
            | AuthError::UnknownUser
            | AuthError::InactiveUser => Code::Unauthenticated,
            AuthError::PermissionDenied => Code::PermissionDenied,
            AuthError::Storage(err) => err.code(),
        }
    }
}

/// Errors occurring when starting the application.
#[derive(Error, Debug)]
pub enum StartupError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    /// MQTT runtime error.
    #[error("MQTT runtime error: {0}")]
    Runtime(#[from] chirpstack_mqtt_integration::error::RuntimeError),
}

/// Error returned by REST handlers.
///
/// Carries a gRPC code which determines the HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// gRPC code.
    pub code: Code,
    /// Error message.
    pub message: String,
}

/// JSON body of an [`ApiError`].
#[derive(Debug, Serialize)]
struct ApiErrorBody {
    /// Error message.
    error: String,
    /// Numeric gRPC code.
    code: i32,
}

impl ApiError {
    /// Creates a new [`ApiError`].
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// HTTP status following the grpc-gateway mapping.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.code {
            Code::Ok => StatusCode::OK,
            Code::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                StatusCode::BAD_REQUEST
            }
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::Unauthenticated => StatusCode::UNAUTHORIZED,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiErrorBody {
            error: self.message,
            code: self.code as i32,
        };
        (status, Json(body)).into_response()
    }
}

impl OperationOutput for ApiError {
    type Inner = Self;
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}

impl From<lpwan_grpc_clients::error::Error> for ApiError {
    fn from(err: lpwan_grpc_clients::error::Error) -> Self {
        match err {
            lpwan_grpc_clients::error::Error::GRPCStatus(status) => {
                ApiError::new(status.code(), status.message())
            }
            err => ApiError::new(Code::Unavailable, err.to_string()),
        }
    }
}

impl From<ApplayerError> for ApiError {
    fn from(err: ApplayerError) -> Self {
        match err {
            ApplayerError::Storage(err) => err.into(),
            ApplayerError::Enqueue(err) => err.into(),
            err => ApiError::new(Code::InvalidArgument, err.to_string()),
        }
    }
}
