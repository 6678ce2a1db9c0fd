//! Error taxonomy shared by every thread-management call.

use thiserror::Error;

/// Reasons a kernel request can be rejected.
///
/// Every operation validates its inputs before touching kernel state, so an
/// `Err` always means that no part of the requested transition was applied.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Invalid or stale thread handle, out-of-range priority, or a
    /// contradictory attribute bundle.
    #[error("invalid parameter")]
    Parameter,
    /// The target exists but its current state does not allow the request.
    #[error("resource not available in the current thread state")]
    Resource,
    /// The call is forbidden from interrupt context.
    #[error("not allowed from interrupt context")]
    Isr,
    /// A bounded wait expired before its condition was met.
    #[error("wait timed out")]
    Timeout,
    /// The memory provider could not satisfy a stack or control-block request.
    #[error("out of memory")]
    NoMemory,
    /// Unspecified internal fault.
    #[error("unspecified kernel error")]
    Generic,
}

impl KernelError {
    pub const fn status(self) -> Status {
        match self {
            KernelError::Parameter => Status::ErrorParameter,
            KernelError::Resource => Status::ErrorResource,
            KernelError::Isr => Status::ErrorIsr,
            KernelError::Timeout => Status::ErrorTimeout,
            KernelError::NoMemory => Status::ErrorNoMemory,
            KernelError::Generic => Status::Error,
        }
    }
}

pub type KernelResult<T> = core::result::Result<T, KernelError>;

/// Numeric status codes in the `osStatus_t` layout, for ports that hand
/// results back across a C boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Error = -1,
    ErrorTimeout = -2,
    ErrorResource = -3,
    ErrorParameter = -4,
    ErrorNoMemory = -5,
    ErrorIsr = -6,
}

impl Status {
    pub fn from_result<T>(result: &KernelResult<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(err) => err.status(),
        }
    }

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl From<KernelError> for Status {
    fn from(err: KernelError) -> Self {
        err.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_cmsis_layout() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::from(KernelError::Parameter).code(), -4);
        assert_eq!(Status::from(KernelError::Resource).code(), -3);
        assert_eq!(Status::from(KernelError::Isr).code(), -6);
        assert_eq!(Status::from(KernelError::NoMemory).code(), -5);
        assert_eq!(Status::from(KernelError::Generic).code(), -1);
    }

    #[test]
    fn from_result_maps_both_arms() {
        let ok: KernelResult<u32> = Ok(7);
        let err: KernelResult<u32> = Err(KernelError::Timeout);
        assert!(Status::from_result(&ok).is_ok());
        assert_eq!(Status::from_result(&err), Status::ErrorTimeout);
    }
}
