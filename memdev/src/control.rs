//! Control surface: opcode-addressed access to device parameters
//!
//! | nr | opcode          | argument          | returns |
//! |----|-----------------|-------------------|---------|
//! | 0  | reset           | none              | 0       |
//! | 1  | set-quantum     | payload in        | 0       |
//! | 2  | set-qset        | payload in        | 0       |
//! | 3  | tell-quantum    | value             | 0       |
//! | 4  | tell-qset       | value             | 0       |
//! | 5  | get-quantum     | payload out       | 0       |
//! | 6  | get-qset        | payload out       | 0       |
//! | 7  | query-quantum   | none              | value   |
//! | 8  | query-qset      | none              | value   |
//! | 9  | exchange-quantum| payload in/out    | 0       |
//! | 10 | exchange-qset   | payload in/out    | 0       |
//! | 11 | shift-quantum   | value             | old     |
//! | 12 | shift-qset      | value             | old     |
//! | 13 | tell-capacity   | value             | 0       |
//! | 14 | query-capacity  | none              | value   |
//!
//! Every opcode that changes a parameter requires [`Credentials::admin`].
//! A payload is one native-endian `i32`.

use std::fmt;

use crate::error::{DeviceError, Result};

const PAYLOAD_SIZE: usize = std::mem::size_of::<i32>();

/// Highest valid opcode number
pub const MAX_OPCODE: u32 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Reset,
    SetQuantum,
    SetQset,
    TellQuantum,
    TellQset,
    GetQuantum,
    GetQset,
    QueryQuantum,
    QueryQset,
    ExchangeQuantum,
    ExchangeQset,
    ShiftQuantum,
    ShiftQset,
    TellCapacity,
    QueryCapacity,
}

impl Opcode {
    const ALL: [Opcode; 15] = [
        Opcode::Reset,
        Opcode::SetQuantum,
        Opcode::SetQset,
        Opcode::TellQuantum,
        Opcode::TellQset,
        Opcode::GetQuantum,
        Opcode::GetQset,
        Opcode::QueryQuantum,
        Opcode::QueryQset,
        Opcode::ExchangeQuantum,
        Opcode::ExchangeQset,
        Opcode::ShiftQuantum,
        Opcode::ShiftQset,
        Opcode::TellCapacity,
        Opcode::QueryCapacity,
    ];

    /// Decode an opcode number
    ///
    /// # Errors
    /// `InvalidArgument` above [`MAX_OPCODE`].
    pub fn from_nr(nr: u32) -> Result<Self> {
        usize::try_from(nr)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| DeviceError::invalid(format!("unknown control opcode {nr}")))
    }

    #[must_use]
    pub fn nr(self) -> u32 {
        self as u32
    }

    /// The parameter this opcode addresses; `None` for reset
    #[must_use]
    pub fn param(self) -> Option<Param> {
        match self {
            Self::Reset => None,
            Self::SetQuantum
            | Self::TellQuantum
            | Self::GetQuantum
            | Self::QueryQuantum
            | Self::ExchangeQuantum
            | Self::ShiftQuantum => Some(Param::Quantum),
            Self::SetQset
            | Self::TellQset
            | Self::GetQset
            | Self::QueryQset
            | Self::ExchangeQset
            | Self::ShiftQset => Some(Param::Qset),
            Self::TellCapacity | Self::QueryCapacity => Some(Param::Capacity),
        }
    }

    /// Whether the opcode may change device state
    #[must_use]
    pub fn is_privileged(self) -> bool {
        !matches!(
            self,
            Self::GetQuantum
                | Self::GetQset
                | Self::QueryQuantum
                | Self::QueryQset
                | Self::QueryCapacity
        )
    }
}

impl TryFrom<u32> for Opcode {
    type Error = DeviceError;

    fn try_from(nr: u32) -> Result<Self> {
        Self::from_nr(nr)
    }
}

/// Tunable device parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Quantum,
    Qset,
    Capacity,
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quantum => write!(f, "quantum"),
            Self::Qset => write!(f, "qset"),
            Self::Capacity => write!(f, "capacity"),
        }
    }
}

/// Argument of a control call
#[derive(Debug)]
pub enum ControlArg<'a> {
    None,
    /// Passed by value
    Value(i64),
    /// Caller memory the device may only read
    In(&'a [u8]),
    /// Caller memory the device may read and write
    InOut(&'a mut [u8]),
}

impl ControlArg<'_> {
    fn value(&self) -> Result<i64> {
        match self {
            Self::Value(v) => Ok(*v),
            _ => Err(DeviceError::invalid("opcode expects a value argument")),
        }
    }

    fn load(&self) -> Result<i32> {
        let bytes: &[u8] = match self {
            Self::In(b) => *b,
            Self::InOut(b) => &**b,
            Self::None | Self::Value(_) => return Err(DeviceError::CopyFault),
        };
        let raw = payload_bytes(bytes)?;
        Ok(i32::from_ne_bytes(raw))
    }

    fn store(&mut self, value: i32) -> Result<()> {
        match self {
            Self::InOut(b) => {
                payload_bytes(&**b)?;
                b.copy_from_slice(&value.to_ne_bytes());
                Ok(())
            }
            Self::In(_) | Self::None | Self::Value(_) => Err(DeviceError::CopyFault),
        }
    }
}

fn payload_bytes(bytes: &[u8]) -> Result<[u8; PAYLOAD_SIZE]> {
    if bytes.len() > PAYLOAD_SIZE {
        return Err(DeviceError::invalid(format!(
            "control payload of {} bytes, expected {PAYLOAD_SIZE}",
            bytes.len()
        )));
    }
    bytes.try_into().map_err(|_| DeviceError::CopyFault)
}

/// Capabilities of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub admin: bool,
}

impl Credentials {
    #[must_use]
    pub fn admin() -> Self {
        Self { admin: true }
    }

    #[must_use]
    pub fn user() -> Self {
        Self { admin: false }
    }
}

/// Parameters of one device instance, as seen by the control surface
pub trait Tunables {
    /// # Errors
    /// `InvalidArgument` if the device has no such parameter.
    fn get(&self, param: Param) -> Result<usize>;

    /// # Errors
    /// `InvalidArgument` if the device has no such parameter or the value
    /// is out of range.
    fn set(&mut self, param: Param, value: usize) -> Result<()>;

    /// Restore the configured defaults
    fn reset(&mut self);
}

fn to_usize(param: Param, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| DeviceError::invalid(format!("{param} must be positive (got {value})")))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_payload(param: Param, value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| DeviceError::invalid(format!("{param} {value} does not fit the payload")))
}

/// Run `op` against `target`
///
/// # Errors
/// - `PermissionDenied` for a mutating opcode without admin credentials
/// - `InvalidArgument` for a parameter the device does not have, a bad
///   value, an oversized payload or a missing value argument
/// - `CopyFault` for a short or missing payload, or a read-only payload
///   that should receive a result
pub fn dispatch(
    op: Opcode,
    mut arg: ControlArg<'_>,
    creds: Credentials,
    target: &mut impl Tunables,
) -> Result<i64> {
    if op.is_privileged() && !creds.admin {
        return Err(DeviceError::PermissionDenied);
    }
    let Some(param) = op.param() else {
        target.reset();
        return Ok(0);
    };
    match op {
        Opcode::Reset => Ok(0),
        Opcode::SetQuantum | Opcode::SetQset => {
            let value = arg.load()?;
            target.set(param, to_usize(param, value.into())?)?;
            Ok(0)
        }
        Opcode::TellQuantum | Opcode::TellQset | Opcode::TellCapacity => {
            let value = arg.value()?;
            target.set(param, to_usize(param, value)?)?;
            Ok(0)
        }
        Opcode::GetQuantum | Opcode::GetQset => {
            let value = to_payload(param, target.get(param)?)?;
            arg.store(value)?;
            Ok(0)
        }
        Opcode::QueryQuantum | Opcode::QueryQset | Opcode::QueryCapacity => {
            Ok(to_i64(target.get(param)?))
        }
        Opcode::ExchangeQuantum | Opcode::ExchangeQset => {
            let new = arg.load()?;
            let old = target.get(param)?;
            target.set(param, to_usize(param, new.into())?)?;
            // No rollback: the parameter stays changed if the copy-out fails
            arg.store(to_payload(param, old)?)?;
            Ok(0)
        }
        Opcode::ShiftQuantum | Opcode::ShiftQset => {
            let value = arg.value()?;
            let old = target.get(param)?;
            target.set(param, to_usize(param, value)?)?;
            Ok(to_i64(old))
        }
    }
}
