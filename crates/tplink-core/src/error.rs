//! Error types for tplink-core.
//!
//! Two layers live here: the library [`Error`] taxonomy that callers match
//! on, and the [`SmartErrorCode`] registry of integer codes returned by
//! SMART-family devices. The registry is partitioned into retryable,
//! authentication, and plain device errors; the protocol retry loops drive
//! off those partitions.

use thiserror::Error;

/// Error type for tplink-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation exceeded the configured timeout. Retryable.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Socket reset or broken mid-request. Retryable.
    #[error("connection error: {0}")]
    Connection(String),

    /// Host down, unreachable, or refusing connections. Not retried.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// Handshake tag mismatch, login failure, or an auth-partition device code.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Session expired, device busy, or another transient device condition.
    /// Consumes one retry from the protocol's retry budget.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Device returned a non-success code outside the retryable/auth sets.
    #[error("device error: {code}")]
    DeviceError {
        /// The code the device reported.
        code: SmartErrorCode,
        /// Method the code was attributed to, when known.
        method: Option<String>,
    },

    /// No protocol/transport pair matches the device's connection parameters.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Decryption or parsing produced garbage after the session was
    /// established, or the device broke the wire format.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns `true` if the protocol retry loop may re-drive the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Connection(_) | Error::Retryable(_)
        )
    }

    /// Builds the right taxonomy variant for a device error code.
    pub fn from_error_code(code: SmartErrorCode, method: Option<&str>) -> Self {
        if code.is_auth() {
            Error::AuthenticationFailed(format!("device returned {code}"))
        } else if code.is_retryable() {
            Error::Retryable(format!("device returned {code}"))
        } else {
            Error::DeviceError {
                code,
                method: method.map(str::to_string),
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout(err.to_string()),
            ErrorKind::ConnectionRefused
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable => Error::Unreachable(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => Error::Connection(err.to_string()),
            _ => Error::Connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(format!("JSON error: {err}"))
    }
}

macro_rules! smart_error_codes {
    ($($name:ident = $code:literal => $desc:literal,)*) => {
        /// Integer error codes returned by SMART-family devices.
        ///
        /// The set is closed; codes not listed here surface as
        /// [`Error::Protocol`] with the raw value preserved in the message.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum SmartErrorCode {
            $(#[doc = $desc] $name,)*
        }

        impl SmartErrorCode {
            /// Looks up a known code; `None` for anything outside the registry.
            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// The raw integer value of this code.
            pub fn code(&self) -> i64 {
                match self {
                    $(Self::$name => $code,)*
                }
            }
        }

        impl std::fmt::Display for SmartErrorCode {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$name => write!(f, "{} ({})", stringify!($name), $code),)*
                }
            }
        }
    };
}

smart_error_codes! {
    Success = 0 => "Request succeeded",

    // Transport-level codes (positive).
    SessionTimeout = 9999 => "Session timed out on the device",
    MultiRequestFailed = 1200 => "multipleRequest batch failed",
    HttpTransportFailed = 1112 => "HTTP transport failure",
    LoginFailed = 1111 => "Login rejected",
    HandshakeFailed = 1100 => "Handshake rejected",
    TransportUnknownCredentials = 1003 => "Transport rejected unknown credentials",
    TransportNotAvailable = 1002 => "Transport not available",
    CommandCancel = 1001 => "Command cancelled",
    NullTransport = 1000 => "Null transport",

    // Common method codes (negative).
    InternalUnknown = -1 => "Internal unknown error",
    Unspecific = -1001 => "Unspecific failure",
    UnknownMethod = -1002 => "Unknown method",
    JsonDecodeFail = -1003 => "Device failed to decode request JSON",
    JsonEncodeFail = -1004 => "Device failed to encode response JSON",
    AesDecodeFail = -1005 => "Device failed to decrypt request",
    RequestLenError = -1006 => "Request length invalid",
    CloudFailed = -1007 => "Cloud operation failed",
    ParamsError = -1008 => "Invalid parameters",
    RsaSignFail = -1009 => "RSA signing failed",
    InvalidPublicKey = -1010 => "Invalid RSA public key",
    SessionParamError = -1101 => "Session parameter invalid",

    // Method-specific codes.
    QuickSetupError = -1201 => "Quick setup failed",
    DeviceError = -1301 => "Generic device failure",
    DeviceNextEvent = -1302 => "No next event",
    FirmwareError = -1401 => "Firmware operation failed",
    FirmwareVerError = -1402 => "Firmware version mismatch",
    LoginError = -1501 => "login_device rejected",
    TimeError = -1601 => "Time operation failed",
    DstError = -1611 => "DST rule error",
    ShareError = -1701 => "Share operation failed",
    DeviceBusy = -2101 => "Device busy",

    // SMARTCAM session codes.
    CamSessionExpired = -40401 => "Camera session expired",
}

impl SmartErrorCode {
    /// Codes that consume a retry and re-drive the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SmartErrorCode::SessionTimeout
                | SmartErrorCode::MultiRequestFailed
                | SmartErrorCode::HttpTransportFailed
                | SmartErrorCode::TransportUnknownCredentials
                | SmartErrorCode::TransportNotAvailable
                | SmartErrorCode::Unspecific
                | SmartErrorCode::SessionParamError
                | SmartErrorCode::DeviceBusy
                | SmartErrorCode::CamSessionExpired
        )
    }

    /// Codes that drop the session and surface as authentication failures.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SmartErrorCode::LoginError
                | SmartErrorCode::LoginFailed
                | SmartErrorCode::HandshakeFailed
                | SmartErrorCode::AesDecodeFail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_known() {
        assert_eq!(
            SmartErrorCode::from_code(-1003),
            Some(SmartErrorCode::JsonDecodeFail)
        );
        assert_eq!(SmartErrorCode::from_code(0), Some(SmartErrorCode::Success));
        assert_eq!(
            SmartErrorCode::from_code(9999),
            Some(SmartErrorCode::SessionTimeout)
        );
    }

    #[test]
    fn test_from_code_unknown() {
        assert_eq!(SmartErrorCode::from_code(-987654), None);
    }

    #[test]
    fn test_code_roundtrip() {
        for code in [-1003, -1501, 1111, 9999, 0, -40401] {
            let known = SmartErrorCode::from_code(code).unwrap();
            assert_eq!(known.code(), code);
        }
    }

    #[test]
    fn test_partitions_disjoint() {
        for code in [
            SmartErrorCode::SessionTimeout,
            SmartErrorCode::LoginError,
            SmartErrorCode::DeviceError,
            SmartErrorCode::JsonDecodeFail,
        ] {
            assert!(!(code.is_retryable() && code.is_auth()));
        }
    }

    #[test]
    fn test_error_from_auth_code() {
        let err = Error::from_error_code(SmartErrorCode::LoginError, None);
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_from_retryable_code() {
        let err = Error::from_error_code(SmartErrorCode::SessionTimeout, Some("get_device_info"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_io_error_classification() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "late");
        assert!(matches!(Error::from(timeout), Error::Timeout(_)));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no");
        let err = Error::from(refused);
        assert!(matches!(err, Error::Unreachable(_)));
        assert!(!err.is_retryable());

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst");
        assert!(Error::from(reset).is_retryable());
    }
}
