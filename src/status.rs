use std::fmt;

use log::error;




/**
 * Terminal outcomes surfaced to the driver loop. The core never raises these
 * itself; it only records the flags the driver inspects to pick one.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCondition {
    VolumeError,
    QStopError,
    FileError,
}




// ============================================================================
impl ExitCondition {

    /// The stable code a driver passes to `std::process::exit`.
    pub fn code(&self) -> i32 {
        match self {
            ExitCondition::VolumeError => -1,
            ExitCondition::QStopError => -2,
            ExitCondition::FileError => -3,
        }
    }
}

impl fmt::Display for ExitCondition {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCondition::VolumeError => write!(fmt, "negative or zero element volume"),
            ExitCondition::QStopError => write!(fmt, "artificial viscosity exceeded qstop"),
            ExitCondition::FileError => write!(fmt, "file error"),
        }
    }
}




/**
 * Host copy of the physics-state violation flags. Each holds the index of an
 * offending element, or `None` if the cycle was clean.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhysicsFlags {
    pub bad_volume: Option<usize>,
    pub bad_q: Option<usize>,
}




// ============================================================================
impl PhysicsFlags {

    /// Map the flags to the exit condition the driver should report, volume
    /// errors taking precedence.
    pub fn exit_condition(&self) -> Option<ExitCondition> {
        if self.bad_volume.is_some() {
            Some(ExitCondition::VolumeError)
        } else if self.bad_q.is_some() {
            Some(ExitCondition::QStopError)
        } else {
            None
        }
    }
}




/// Report a platform failure with its call site and terminate. Device and
/// communication state can't be trusted after one of these.
///
pub fn fatal<E: fmt::Display>(err: E, expr: &str, file: &str, line: u32) -> ! {
    error!("platform error at {}:{} code=\"{}\" \"{}\"", file, line, err, expr);
    std::process::exit(1)
}

/// Unwrap the result of a device or communication-layer call, or report it
/// with file/line context and exit the process.
///
#[macro_export]
macro_rules! check_platform {
    ($val:expr) => {
        match $val {
            Ok(v) => v,
            Err(e) => $crate::status::fatal(e, stringify!($val), file!(), line!()),
        }
    };
}
