use strum::FromRepr;

/// Type alias for result of general functions.
pub type SysResult<T> = Result<T, SysError>;

/// Linux specific error codes defined in `errno.h`.
// See in "asm-generic/errno-base.h" and "asm-generic/errno.h".
/// https://elixir.bootlin.com/linux/v6.8.9/source/include/uapi/asm-generic/errno.h#L71
#[derive(FromRepr, Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum SysError {
    /// Operation not permitted
    EPERM = 1,
    /// No such file or directory
    ENOENT = 2,
    /// Try again
    EAGAIN = 11,
    /// Out of memory
    ENOMEM = 12,
    /// Permission denied
    EACCES = 13,
    /// Bad address
    EFAULT = 14,
    /// Device or resource busy
    EBUSY = 16,
    /// File exists
    EEXIST = 17,
    /// Invalid argument
    EINVAL = 22,
}

impl SysError {
    /// Returns the error description.
    pub const fn as_str(&self) -> &'static str {
        use self::SysError::*;
        match self {
            EPERM => "Operation not permitted",
            ENOENT => "No such file or directory",
            EAGAIN => "Try again",
            ENOMEM => "Out of memory",
            EACCES => "Permission denied",
            EFAULT => "Bad address",
            EBUSY => "Device or resource busy",
            EEXIST => "File exists",
            EINVAL => "Invalid argument",
        }
    }

    /// Converts an errno value back into a [`SysError`].
    ///
    /// Returns `None` for codes this type does not model.
    pub const fn from_i32(value: i32) -> Option<Self> {
        Self::from_repr(value)
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl core::fmt::Display for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} (errno {})", self.as_str(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_through_repr() {
        assert_eq!(SysError::from_i32(22), Some(SysError::EINVAL));
        assert_eq!(SysError::ENOMEM.code(), 12);
        assert_eq!(SysError::from_i32(4095), None);
    }
}
