//! Holding-register map of the Sinamics V20 Modbus interface.
//!
//! The map is a fixed table resolved at compile time: every register is a
//! [`Register`] variant and carries a static [`RegisterSpec`]. Variants are
//! declared in ascending address order, so the derived `Ord` is address order
//! and a `BTreeMap<Register, _>` iterates the way the device lays registers out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// First holding-register reference; protocol offsets count from here.
pub const HOLDING_REGISTER_BASE: u16 = 40001;

/// Largest register count a single read frame may request.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Zero-based protocol address of a holding register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegisterAddress(pub u16);

impl RegisterAddress {
    pub fn from_reference(reference: u16) -> Self {
        Self(reference.saturating_sub(HOLDING_REGISTER_BASE))
    }

    /// Protocol addresses past the 4xxxx range have no reference number; they wrap.
    pub fn reference(&self) -> u16 {
        self.0.wrapping_add(HOLDING_REGISTER_BASE)
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x})", self.reference(), self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterSpec {
    pub reference: u16,
    pub name: &'static str,
    pub access: Access,
    pub unit: &'static str,
    pub scale: u16,
    pub signed: bool,
}

macro_rules! register_map {
    ($( $variant:ident => ($reference:expr, $name:expr, $access:ident, $unit:expr, $scale:expr, $signed:expr) ),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum Register {
            $( $variant, )+
        }

        impl Register {
            pub const ALL: &'static [Register] = &[ $( Register::$variant, )+ ];

            pub fn spec(&self) -> &'static RegisterSpec {
                match self {
                    $( Register::$variant => &RegisterSpec {
                        reference: $reference,
                        name: $name,
                        access: Access::$access,
                        unit: $unit,
                        scale: $scale,
                        signed: $signed,
                    }, )+
                }
            }
        }
    };
}

register_map! {
    WatchdogTime    => (40001, "WDOG_TIME", ReadWrite, "ms", 1, false),
    WatchdogAction  => (40002, "WDOG_ACTION", ReadWrite, "", 1, false),
    FreqRef         => (40003, "FREQ_REF", ReadWrite, "%", 100, false),
    RunEnable       => (40004, "RUN_ENABLE", ReadWrite, "", 1, false),
    CmdFwdRev       => (40005, "CMD_FWD_REV", ReadWrite, "", 1, false),
    CmdStart        => (40006, "CMD_START", ReadWrite, "", 1, false),
    FaultAck        => (40007, "FAULT_ACK", ReadWrite, "", 1, false),
    PidSetpointRef  => (40008, "PID_SETP_REF", ReadWrite, "%", 100, true),
    EnablePid       => (40009, "ENABLE_PID", ReadWrite, "", 1, false),
    CurrentLimit    => (40010, "CURRENT_LMT", ReadWrite, "%", 10, false),
    AccelTime       => (40011, "ACCEL_TIME", ReadWrite, "s", 100, false),
    DecelTime       => (40012, "DECEL_TIME", ReadWrite, "s", 100, false),
    DigitalOut1     => (40014, "DIGITAL_OUT_1", ReadWrite, "", 1, false),
    DigitalOut2     => (40015, "DIGITAL_OUT_2", ReadWrite, "", 1, false),
    RefFreq         => (40016, "REF_FREQ", ReadWrite, "Hz", 100, false),
    PidUpperLimit   => (40017, "PID_UP_LMT", ReadWrite, "%", 100, true),
    PidLowerLimit   => (40018, "PID_LO_LMT", ReadWrite, "%", 100, true),
    PGain           => (40019, "P_GAIN", ReadWrite, "", 1000, false),
    IGain           => (40020, "I_GAIN", ReadWrite, "s", 1, false),
    DGain           => (40021, "D_GAIN", ReadWrite, "", 1, false),
    FeedbackGain    => (40022, "FEEDBK_GAIN", ReadWrite, "%", 100, false),
    LowPass         => (40023, "LOW_PASS", ReadWrite, "", 100, false),
    FreqOutput      => (40024, "FREQ_OUTPUT", Read, "Hz", 100, true),
    Speed           => (40025, "SPEED", Read, "RPM", 1, true),
    Current         => (40026, "CURRENT", Read, "A", 100, false),
    Torque          => (40027, "TORQUE", Read, "Nm", 100, true),
    ActualPower     => (40028, "ACTUAL_PWR", Read, "kW", 100, false),
    TotalKwh        => (40029, "TOTAL_KWH", Read, "kWh", 1, false),
    DcBusVolts      => (40030, "DC_BUS_VOLTS", Read, "V", 1, false),
    Reference       => (40031, "REFERENCE", Read, "Hz", 100, true),
    RatedPower      => (40032, "RATED_PWR", Read, "kW", 100, false),
    OutputVolts     => (40033, "OUTPUT_VOLTS", Read, "V", 1, false),
    FwdRev          => (40034, "FWD_REV", Read, "", 1, false),
    StopRun         => (40035, "STOP_RUN", Read, "", 1, false),
    AtMaxFreq       => (40036, "AT_MAX_FREQ", Read, "", 1, false),
    ControlMode     => (40037, "CONTROL_MODE", Read, "", 1, false),
    Enabled         => (40038, "ENABLED", Read, "", 1, false),
    ReadyToRun      => (40039, "READY_TO_RUN", Read, "", 1, false),
    AnalogIn1       => (40040, "ANALOG_IN_1", Read, "%", 100, true),
    AnalogIn2       => (40041, "ANALOG_IN_2", Read, "%", 100, true),
    AnalogOut1      => (40042, "ANALOG_OUT_1", Read, "%", 100, false),
    FreqActual      => (40044, "FREQ_ACTUAL", Read, "%", 100, true),
    PidSetpointOut  => (40045, "PID_SETP_OUT", Read, "%", 100, true),
    PidOutput       => (40046, "PID_OUTPUT", Read, "%", 100, true),
    PidFeedback     => (40047, "PID_FEEDBACK", Read, "%", 100, true),
    DigitalIn1      => (40048, "DIGITAL_IN_1", Read, "", 1, false),
    DigitalIn2      => (40049, "DIGITAL_IN_2", Read, "", 1, false),
    DigitalIn3      => (40050, "DIGITAL_IN_3", Read, "", 1, false),
    DigitalIn4      => (40051, "DIGITAL_IN_4", Read, "", 1, false),
    Fault           => (40054, "FAULT", Read, "", 1, false),
    LastFault       => (40055, "LAST_FAULT", Read, "", 1, false),
    Fault1          => (40056, "FAULT_1", Read, "", 1, false),
    Fault2          => (40057, "FAULT_2", Read, "", 1, false),
    Fault3          => (40058, "FAULT_3", Read, "", 1, false),
    Warning         => (40059, "WARNING", Read, "", 1, false),
    LastWarning     => (40060, "LAST_WARNING", Read, "", 1, false),
    InverterVersion => (40061, "INVERTER_VER", Read, "", 100, false),
    DriveModel      => (40062, "DRIVE_MODEL", Read, "", 1, false),
    Stw             => (40100, "STW", ReadWrite, "", 1, false),
    Hsw             => (40101, "HSW", ReadWrite, "", 1, true),
    Zsw             => (40110, "ZSW", Read, "", 1, false),
    Hiw             => (40111, "HIW", Read, "", 1, true),
    InverterModel   => (40300, "INVERTER_MODEL", Read, "", 1, false),
    FirmwareVersion => (40301, "FIRMWARE_VER", Read, "", 100, false),
    HandAuto        => (40349, "HAND_AUTO", Read, "", 1, false),
    Fault4          => (40403, "FAULT_4", Read, "", 1, false),
    Fault5          => (40404, "FAULT_5", Read, "", 1, false),
    Fault6          => (40405, "FAULT_6", Read, "", 1, false),
    Fault7          => (40406, "FAULT_7", Read, "", 1, false),
    Fault8          => (40407, "FAULT_8", Read, "", 1, false),
    PrmErrorCode    => (40499, "PRM_ERROR_CODE", Read, "", 1, false),
    PiFeedback      => (40521, "PI_FEEDBACK", Read, "%", 100, true),
}

/// Registers read on every monitor tick. Coalesces into five read frames.
pub const POLL_SET: &[Register] = &[
    Register::FreqOutput,
    Register::Speed,
    Register::Current,
    Register::Torque,
    Register::ActualPower,
    Register::TotalKwh,
    Register::DcBusVolts,
    Register::Reference,
    Register::RatedPower,
    Register::OutputVolts,
    Register::Fault,
    Register::LastFault,
    Register::Warning,
    Register::Stw,
    Register::Hsw,
    Register::Zsw,
    Register::Hiw,
];

impl Register {
    pub fn address(&self) -> RegisterAddress {
        RegisterAddress::from_reference(self.spec().reference)
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    pub fn is_writable(&self) -> bool {
        self.spec().access == Access::ReadWrite
    }

    /// Engineering value of a raw register word.
    pub fn scale_value(&self, raw: u16) -> f64 {
        let spec = self.spec();
        let value = if spec.signed { raw as i16 as f64 } else { raw as f64 };
        value / spec.scale as f64
    }

    pub fn from_name(name: &str) -> Option<Register> {
        Register::ALL
            .iter()
            .copied()
            .find(|r| r.name().eq_ignore_ascii_case(name))
    }

    pub fn from_address(address: RegisterAddress) -> Option<Register> {
        Register::ALL
            .binary_search_by_key(&address, |r| r.address())
            .ok()
            .map(|index| Register::ALL[index])
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name(), self.spec().reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_are_declared_in_address_order() {
        for pair in Register::ALL.windows(2) {
            assert!(
                pair[0].address() < pair[1].address(),
                "{} must precede {}",
                pair[0],
                pair[1]
            );
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn protocol_offsets_count_from_40001() {
        assert_eq!(Register::WatchdogTime.address(), RegisterAddress(0));
        assert_eq!(Register::Speed.address(), RegisterAddress(0x18));
        assert_eq!(Register::Zsw.address(), RegisterAddress(0x6d));
        assert_eq!(Register::PiFeedback.address(), RegisterAddress(0x208));
    }

    #[test]
    fn addresses_outside_the_map_still_display() {
        let far = RegisterAddress(0xFFFF);
        assert_eq!(far.reference(), 40000);
        assert_eq!(far.to_string(), "40000 (0xffff)");
        assert_eq!(RegisterAddress(25535).reference(), 0);
    }

    #[test]
    fn signed_registers_scale_through_i16() {
        assert_eq!(Register::Speed.scale_value(0xFFCE), -50.0);
        assert_eq!(Register::Current.scale_value(250), 2.5);
        assert_eq!(Register::FreqOutput.scale_value(5000), 50.0);
    }

    #[test]
    fn poll_set_is_read_only_status_plus_process_data() {
        assert!(POLL_SET.windows(2).all(|w| w[0] < w[1]));
        assert!(POLL_SET.contains(&Register::Zsw));
        assert_eq!(Register::from_name("speed"), Some(Register::Speed));
        assert_eq!(Register::from_address(RegisterAddress(0x18)), Some(Register::Speed));
        assert_eq!(Register::from_address(RegisterAddress(12)), None);
    }
}
