use crate::error::Error;
use internment::Intern;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const NS_PER_SECOND: i128 = 1_000_000_000;

/// The type of a data stream clock: a named cycle counter with a
/// frequency and an offset from the epoch.
///
/// A clock class becomes immutable once a stream class referencing it
/// is added to a trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClockClass {
    frozen: bool,
    name: Intern<String>,
    frequency: u64,
    precision: u64,
    offset_seconds: i64,
    offset_cycles: u64,
    absolute: bool,
    description: Option<String>,
    uuid: Uuid,
}

impl ClockClass {
    /// Creates a clock class with a 1 GHz frequency and a fresh UUID.
    pub fn new<S: Into<String>>(name: S) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::invalid("clock class name is empty"));
        }
        Ok(Self {
            frozen: false,
            name: Intern::new(name),
            frequency: 1_000_000_000,
            precision: 0,
            offset_seconds: 0,
            offset_cycles: 0,
            absolute: false,
            description: None,
            uuid: Uuid::new_v4(),
        })
    }

    pub fn name(&self) -> Intern<String> {
        self.name
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    pub fn precision(&self) -> u64 {
        self.precision
    }

    pub fn offset_seconds(&self) -> i64 {
        self.offset_seconds
    }

    pub fn offset_cycles(&self) -> u64 {
        self.offset_cycles
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    fn check_frozen(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen("clock class"))
        } else {
            Ok(())
        }
    }

    pub fn set_frequency(&mut self, frequency: u64) -> Result<(), Error> {
        self.check_frozen()?;
        if frequency == 0 {
            return Err(Error::invalid("clock frequency must be positive"));
        }
        self.frequency = frequency;
        Ok(())
    }

    pub fn set_precision(&mut self, precision: u64) -> Result<(), Error> {
        self.check_frozen()?;
        self.precision = precision;
        Ok(())
    }

    pub fn set_offset_seconds(&mut self, seconds: i64) -> Result<(), Error> {
        self.check_frozen()?;
        self.offset_seconds = seconds;
        Ok(())
    }

    pub fn set_offset_cycles(&mut self, cycles: u64) -> Result<(), Error> {
        self.check_frozen()?;
        self.offset_cycles = cycles;
        Ok(())
    }

    pub fn set_absolute(&mut self, absolute: bool) -> Result<(), Error> {
        self.check_frozen()?;
        self.absolute = absolute;
        Ok(())
    }

    pub fn set_description<S: Into<String>>(&mut self, description: S) -> Result<(), Error> {
        self.check_frozen()?;
        self.description = Some(description.into());
        Ok(())
    }

    pub fn set_uuid(&mut self, uuid: Uuid) -> Result<(), Error> {
        self.check_frozen()?;
        self.uuid = uuid;
        Ok(())
    }
}

impl PartialEq for ClockClass {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.frequency == other.frequency
            && self.precision == other.precision
            && self.offset_seconds == other.offset_seconds
            && self.offset_cycles == other.offset_cycles
            && self.absolute == other.absolute
            && self.description == other.description
            && self.uuid == other.uuid
    }
}

/// A raw cycle count paired with its clock class, memoizing the
/// equivalent nanoseconds from the epoch.
#[derive(Clone, PartialEq, Debug)]
pub struct ClockValue {
    clock_name: Intern<String>,
    cycles: u64,
    ns_from_epoch: i64,
}

impl ClockValue {
    pub fn new(clock: &ClockClass, cycles: u64) -> Self {
        // 128-bit intermediates: cycles * 10^9 overflows u64 for any
        // frequency above 1 GHz worth of runtime.
        let total_cycles = clock.offset_cycles() as i128 + cycles as i128;
        let ns = clock.offset_seconds() as i128 * NS_PER_SECOND
            + total_cycles * NS_PER_SECOND / clock.frequency() as i128;
        Self {
            clock_name: clock.name(),
            cycles,
            ns_from_epoch: ns as i64,
        }
    }

    pub fn clock_name(&self) -> Intern<String> {
        self.clock_name
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn ns_from_epoch(&self) -> i64 {
        self.ns_from_epoch
    }
}

/// Folds a new N-bit cycle snapshot into an accumulated clock value.
///
/// When the snapshot is smaller than the current low N bits, a single
/// wrap of the N-bit counter is assumed; the low bits are then replaced
/// by the snapshot. A 64-bit snapshot replaces the value outright.
pub(crate) fn apply_cycle_wrap(current: u64, snapshot: u64, size_bits: u32) -> u64 {
    if size_bits == 64 {
        return snapshot;
    }
    debug_assert!(size_bits >= 1 && size_bits < 64);
    let mask = (1u64 << size_bits) - 1;
    let mut current = current;
    if snapshot < (current & mask) {
        current += mask + 1;
    }
    (current & !mask) | snapshot
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn clock() -> ClockClass {
        ClockClass::new("monotonic").unwrap()
    }

    #[test]
    fn ns_from_epoch_uses_wide_arithmetic() {
        let mut c = clock();
        c.set_frequency(2_500_000_000).unwrap();
        c.set_offset_seconds(10).unwrap();
        c.set_offset_cycles(5_000_000_000).unwrap();

        let v = ClockValue::new(&c, 7_500_000_000);
        // 10s + (5e9 + 7.5e9) cycles / 2.5GHz = 10s + 5s
        assert_eq!(v.ns_from_epoch(), 15_000_000_000);
        assert_eq!(v.cycles(), 7_500_000_000);
    }

    #[test]
    fn frozen_clock_rejects_mutation() {
        let mut c = clock();
        c.freeze();
        assert!(matches!(c.set_frequency(1), Err(Error::Frozen(_))));
        assert!(matches!(c.set_absolute(true), Err(Error::Frozen(_))));
    }

    #[test]
    fn rollover_tracking_u8() {
        // 5 ticks before rollover, then 10 ticks after it
        let t0 = u64::from(u8::MAX - 5);
        let mut acc = t0;
        acc = apply_cycle_wrap(acc, 10, 8);
        assert_eq!(acc, t0 + 16);
    }

    #[test]
    fn rollover_tracking_u32() {
        let t0 = u64::from(u32::MAX - 5);
        let mut acc = t0;
        acc = apply_cycle_wrap(acc, 10, 32);
        assert_eq!(acc, t0 + 16);
    }

    #[test]
    fn no_rollover_tracking_u64() {
        let acc = apply_cycle_wrap(u64::MAX - 5, 10, 64);
        assert_eq!(acc, 10);
    }

    #[test]
    fn monotonic_values_do_not_wrap() {
        let mut acc = 100;
        acc = apply_cycle_wrap(acc, 150, 27);
        assert_eq!(acc, 150);
        acc = apply_cycle_wrap(acc, 151, 27);
        assert_eq!(acc, 151);
    }

    #[test]
    fn wrap_27_bit_sequence() {
        let mut acc = 0x7FF_FFF0;
        acc = apply_cycle_wrap(acc, 0x0000_0A0, 27);
        assert_eq!(acc, 0x800_00A0);
        acc = apply_cycle_wrap(acc, 0x0000_200, 27);
        assert_eq!(acc, 0x800_0200);
    }
}
