#![no_std]

/// Compiles `$blk` only when the `ondebug` feature of the calling crate is on.
///
/// Used for consistency checks that are too noisy or too slow for normal
/// builds. The calling crate must declare an `ondebug` feature.
#[macro_export]
macro_rules! when_debug {
    ($blk:expr) => {
        #[cfg(feature = "ondebug")]
        {
            $blk
        }
    };
}
