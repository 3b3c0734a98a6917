use std::{fmt, io};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Internal = 3,
    Usage = 4,
    Format = 6,
    ProcessState = 9,
    Sanity = 16,
    TooLong = 20,
    TypeMismatch = 23,

    // Memory Accessor reported a fault (unmapped page, permissions, dead process).
    UnreadableMemory = 30,
    // Self-reference check failed, or the descriptor has an impossible field combination.
    CorruptDescriptor = 31,
    // Revision marker in the target doesn't match layout::ABI_REVISION.
    UnsupportedAbi = 32,
    // Array count or field count exceeds what readable memory can hold.
    ImplausibleLength = 33,
    // RuntimeKind code outside the closed enumeration.
    UnrepresentableKind = 34,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
    // Target address that triggered the error, if any.
    pub addr: Option<usize>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error {
        Error {error: ErrorEnum::Code(code), message, addr: None}
    }

    pub fn from_io_error(e: io::Error, message: String) -> Error {
        Error {error: ErrorEnum::IO(e), message, addr: None}
    }

    // Attach the offending address. Keeps the innermost address if one is already there.
    pub fn at(mut self, addr: usize) -> Error {
        if self.addr.is_none() {
            self.addr = Some(addr);
        }
        self
    }

    pub fn code(&self) -> Option<ErrorCode> { match self.error { ErrorEnum::Code(c) => Some(c), ErrorEnum::IO(_) => None } }

    pub fn is_unreadable_memory(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::UnreadableMemory) => true, _ => false, } }
    pub fn is_corrupt_descriptor(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::CorruptDescriptor) => true, _ => false, } }
    pub fn is_unsupported_abi(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::UnsupportedAbi) => true, _ => false, } }
    pub fn is_implausible_length(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::ImplausibleLength) => true, _ => false, } }
    pub fn is_unrepresentable_kind(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::UnrepresentableKind) => true, _ => false, } }
    pub fn is_usage(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Usage) => true, _ => false, } }
    pub fn is_too_long(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::TooLong) => true, _ => false, } }
    pub fn is_type_mismatch(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::TypeMismatch) => true, _ => false, } }
    pub fn is_io_permission_denied(&self) -> bool { match &self.error { ErrorEnum::IO(e) if e.kind() == io::ErrorKind::PermissionDenied => true, _ => false, } }

    // What the host surface shows in place of a value that failed to decode.
    pub fn marker(&self) -> &'static str {
        match self.error {
            ErrorEnum::Code(ErrorCode::UnreadableMemory) => "<unreadable>",
            ErrorEnum::Code(ErrorCode::CorruptDescriptor) => "<corrupt type>",
            ErrorEnum::Code(ErrorCode::UnsupportedAbi) => "<unsupported abi>",
            ErrorEnum::Code(ErrorCode::ImplausibleLength) => "<implausible length>",
            ErrorEnum::Code(ErrorCode::UnrepresentableKind) => "<unrepresentable kind>",
            ErrorEnum::Code(ErrorCode::TooLong) => "<truncated>",
            ErrorEnum::IO(ref e) if e.kind() == io::ErrorKind::PermissionDenied => "<permission denied>",
            _ => "<error>",
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new(), addr: None}
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error), addr: None}
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error), addr: None}
    }
}

impl From<std::fmt::Error> for Error {
    fn from(error: std::fmt::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error), addr: None}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message)?,
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error)?,
        }
        if let Some(a) = self.addr {
            write!(f, " @0x{:x}", a)?;
        }
        Ok(())
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message)?,
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error)?,
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error)?,
        }
        if let Some(a) = self.addr {
            write!(f, " (at 0x{:x})", a)?;
        }
        Ok(())
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(c.clone()),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        Error {error: ErrorEnum::Code(ErrorCode::$code), message: format!($($arg)*), addr: None}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err(error!($code, $($arg)*))
    );
}

// Same as err!, with the offending target address attached.
#[macro_export]
macro_rules! err_at {
    ($code:ident, $addr:expr, $($arg:tt)*) => (
        Err(error!($code, $($arg)*).at($addr))
    );
}

#[macro_export]
macro_rules! errno_err {
    ($($arg:tt)*) => (
        Err(Error {error: ErrorEnum::IO(::std::io::Error::last_os_error()), message: format!($($arg)*), addr: None})
    );
}

#[cfg(test)]
mod tests {
    use crate::{*, error::*};

    #[test]
    fn address_is_kept_from_innermost() {
        let e: Result<()> = err_at!(UnreadableMemory, 0x1000, "bad address");
        let e = e.unwrap_err().at(0x2000);
        assert_eq!(e.addr, Some(0x1000));
        assert!(e.is_unreadable_memory());
        assert_eq!(e.marker(), "<unreadable>");
        assert_eq!(format!("{}", e), "bad address (at 0x1000)");
    }

    #[test]
    fn markers() {
        assert_eq!(error!(CorruptDescriptor, "x").marker(), "<corrupt type>");
        assert_eq!(error!(UnsupportedAbi, "x").marker(), "<unsupported abi>");
        assert_eq!(error!(ImplausibleLength, "x").marker(), "<implausible length>");
        assert_eq!(error!(UnrepresentableKind, "x").marker(), "<unrepresentable kind>");
        assert_eq!(error!(Internal, "x").marker(), "<error>");
    }
}
