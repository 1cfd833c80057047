//! Backend for the WaveForms runtime (`dwf`), loaded at run time.

use crate::{
    AcqError, AcquisitionConfig, CaptureStatus, ChannelConfig, DeviceHandle, DeviceInfo,
    Instrument, InstrumentError, TriggerEdge, TriggerSource,
};
use libc::{c_char, c_double, c_int, c_uchar};
use libloading::Library;
use log::{debug, info, warn};
use std::ffi::CStr;

#[cfg(target_os = "windows")]
const LIBRARY_NAMES: &[&str] = &["dwf.dll"];
#[cfg(target_os = "macos")]
const LIBRARY_NAMES: &[&str] = &["/Library/Frameworks/dwf.framework/dwf", "libdwf.dylib"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBRARY_NAMES: &[&str] = &["libdwf.so", "libdwf.so.3"];

const ENUMFILTER_ALL: c_int = 0;
const ACQMODE_SINGLE: c_int = 1;
const TRIGTYPE_EDGE: c_int = 0;

const TRIGSRC_NONE: c_uchar = 0;
const TRIGSRC_DETECTOR_ANALOG_IN: c_uchar = 2;
const TRIGSRC_EXTERNAL1: c_uchar = 11;

#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DwfErc {
    NoErc = 0,
    Unknown = 1,
    ApiLockTimeout = 2,
    AlreadyOpened = 3,
    NotSupported = 4,
    InvalidParameter0 = 0x10,
    InvalidParameter1 = 0x11,
    InvalidParameter2 = 0x12,
    InvalidParameter3 = 0x13,
    InvalidParameter4 = 0x14,
}

impl From<i32> for DwfErc {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::NoErc,
            2 => Self::ApiLockTimeout,
            3 => Self::AlreadyOpened,
            4 => Self::NotSupported,
            0x10 => Self::InvalidParameter0,
            0x11 => Self::InvalidParameter1,
            0x12 => Self::InvalidParameter2,
            0x13 => Self::InvalidParameter3,
            0x14 => Self::InvalidParameter4,
            _ => Self::Unknown,
        }
    }
}

type FnVersion = unsafe extern "C" fn(*mut c_char) -> c_int;
type FnEnum = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type FnEnumString = unsafe extern "C" fn(c_int, *mut c_char) -> c_int;
type FnOpen = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type FnHandle = unsafe extern "C" fn(c_int) -> c_int;
type FnOutInt = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type FnLastError = unsafe extern "C" fn(*mut c_int) -> c_int;
type FnLastErrorMsg = unsafe extern "C" fn(*mut c_char) -> c_int;
type FnSetInt = unsafe extern "C" fn(c_int, c_int) -> c_int;
type FnSetDouble = unsafe extern "C" fn(c_int, c_double) -> c_int;
type FnSetU8 = unsafe extern "C" fn(c_int, c_uchar) -> c_int;
type FnChannelInt = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type FnChannelDouble = unsafe extern "C" fn(c_int, c_int, c_double) -> c_int;
type FnConfigure = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type FnStatus = unsafe extern "C" fn(c_int, c_int, *mut c_uchar) -> c_int;
type FnStatusData = unsafe extern "C" fn(c_int, c_int, *mut c_double, c_int) -> c_int;

/// Entry points resolved from the library. The pointers stay valid for as
/// long as `_lib` is loaded.
struct Api {
    get_version: FnVersion,
    enumerate: FnEnum,
    enum_device_name: FnEnumString,
    enum_sn: FnEnumString,
    device_open: FnOpen,
    device_close: FnHandle,
    get_last_error: FnLastError,
    get_last_error_msg: FnLastErrorMsg,
    channel_count: FnOutInt,
    channel_enable: FnChannelInt,
    channel_range: FnChannelDouble,
    channel_offset: FnChannelDouble,
    acquisition_mode: FnSetInt,
    frequency: FnSetDouble,
    buffer_size: FnSetInt,
    trigger_source: FnSetU8,
    trigger_type: FnSetInt,
    trigger_channel: FnSetInt,
    trigger_level: FnSetDouble,
    trigger_condition: FnSetInt,
    trigger_auto_timeout: FnSetDouble,
    configure: FnConfigure,
    status: FnStatus,
    samples_valid: FnOutInt,
    status_data: FnStatusData,
    _lib: Library,
}

/// Copy a symbol out of `lib`.
///
/// # Safety
/// `T` must match the C signature of `name`.
unsafe fn sym<T: Copy>(lib: &Library, name: &str) -> Result<T, AcqError> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    lib.get::<T>(&bytes)
        .map(|s| *s)
        .map_err(|e| AcqError::LibraryUnavailable(format!("{name}: {e}")))
}

impl Api {
    fn load() -> Result<Self, AcqError> {
        let mut failures = Vec::new();
        for name in LIBRARY_NAMES {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    debug!("Loaded {}", name);
                    return unsafe { Self::resolve(lib) };
                }
                Err(e) => failures.push(format!("{name}: {e}")),
            }
        }
        Err(AcqError::LibraryUnavailable(failures.join("; ")))
    }

    unsafe fn resolve(lib: Library) -> Result<Self, AcqError> {
        Ok(Self {
            get_version: sym(&lib, "FDwfGetVersion")?,
            enumerate: sym(&lib, "FDwfEnum")?,
            enum_device_name: sym(&lib, "FDwfEnumDeviceName")?,
            enum_sn: sym(&lib, "FDwfEnumSN")?,
            device_open: sym(&lib, "FDwfDeviceOpen")?,
            device_close: sym(&lib, "FDwfDeviceClose")?,
            get_last_error: sym(&lib, "FDwfGetLastError")?,
            get_last_error_msg: sym(&lib, "FDwfGetLastErrorMsg")?,
            channel_count: sym(&lib, "FDwfAnalogInChannelCount")?,
            channel_enable: sym(&lib, "FDwfAnalogInChannelEnableSet")?,
            channel_range: sym(&lib, "FDwfAnalogInChannelRangeSet")?,
            channel_offset: sym(&lib, "FDwfAnalogInChannelOffsetSet")?,
            acquisition_mode: sym(&lib, "FDwfAnalogInAcquisitionModeSet")?,
            frequency: sym(&lib, "FDwfAnalogInFrequencySet")?,
            buffer_size: sym(&lib, "FDwfAnalogInBufferSizeSet")?,
            trigger_source: sym(&lib, "FDwfAnalogInTriggerSourceSet")?,
            trigger_type: sym(&lib, "FDwfAnalogInTriggerTypeSet")?,
            trigger_channel: sym(&lib, "FDwfAnalogInTriggerChannelSet")?,
            trigger_level: sym(&lib, "FDwfAnalogInTriggerLevelSet")?,
            trigger_condition: sym(&lib, "FDwfAnalogInTriggerConditionSet")?,
            trigger_auto_timeout: sym(&lib, "FDwfAnalogInTriggerAutoTimeoutSet")?,
            configure: sym(&lib, "FDwfAnalogInConfigure")?,
            status: sym(&lib, "FDwfAnalogInStatus")?,
            samples_valid: sym(&lib, "FDwfAnalogInStatusSamplesValid")?,
            status_data: sym(&lib, "FDwfAnalogInStatusData")?,
            _lib: lib,
        })
    }
}

/// Read a NUL-terminated string the library wrote into `buf`.
fn c_string(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf.iter().map(|&c| c as u8).collect();
    match CStr::from_bytes_until_nul(&bytes) {
        Ok(s) => s.to_string_lossy().trim().to_string(),
        Err(_) => String::from_utf8_lossy(&bytes).trim().to_string(),
    }
}

pub struct DwfInstrument {
    api: Api,
}

impl DwfInstrument {
    pub fn load() -> Result<Self, AcqError> {
        let api = Api::load()?;
        let instrument = Self { api };
        match instrument.version() {
            Ok(v) => info!("WaveForms runtime {}", v),
            Err(e) => warn!("Could not read WaveForms version: {}", e),
        }
        Ok(instrument)
    }

    pub fn version(&self) -> Result<String, InstrumentError> {
        let mut buf = [0 as c_char; 32];
        let ok = unsafe { (self.api.get_version)(buf.as_mut_ptr()) };
        self.check("FDwfGetVersion", ok)?;
        Ok(c_string(&buf))
    }

    /// Turn a call's return value into a result, fetching the library's last
    /// error when it reports failure.
    fn check(&self, call: &'static str, ok: c_int) -> Result<(), InstrumentError> {
        if ok != 0 {
            return Ok(());
        }
        let (code, message) = self.last_error();
        Err(InstrumentError::new(call, code, message))
    }

    fn last_error(&self) -> (i32, String) {
        let mut code: c_int = 0;
        let mut msg = [0 as c_char; 512];
        unsafe {
            (self.api.get_last_error)(&mut code);
            (self.api.get_last_error_msg)(msg.as_mut_ptr());
        }
        let mut message = c_string(&msg);
        if message.is_empty() {
            message = format!("{:?}", DwfErc::from(code));
        }
        (code, message)
    }

    fn index(call: &'static str, value: usize) -> Result<c_int, InstrumentError> {
        c_int::try_from(value).map_err(|_| {
            InstrumentError::new(
                call,
                DwfErc::InvalidParameter1 as i32,
                format!("{value} out of range"),
            )
        })
    }
}

impl Instrument for DwfInstrument {
    fn device_count(&mut self) -> Result<usize, InstrumentError> {
        let mut n: c_int = 0;
        let ok = unsafe { (self.api.enumerate)(ENUMFILTER_ALL, &mut n) };
        self.check("FDwfEnum", ok)?;
        Ok(n.max(0) as usize)
    }

    fn device_info(&mut self, index: usize) -> Result<DeviceInfo, InstrumentError> {
        let idx = Self::index("FDwfEnumDeviceName", index)?;
        let mut name = [0 as c_char; 32];
        let mut serial = [0 as c_char; 32];
        let ok = unsafe { (self.api.enum_device_name)(idx, name.as_mut_ptr()) };
        self.check("FDwfEnumDeviceName", ok)?;
        let ok = unsafe { (self.api.enum_sn)(idx, serial.as_mut_ptr()) };
        self.check("FDwfEnumSN", ok)?;
        Ok(DeviceInfo {
            index,
            name: c_string(&name),
            serial: c_string(&serial),
            library_version: self.version().unwrap_or_default(),
        })
    }

    fn open(&mut self, index: usize) -> Result<DeviceHandle, InstrumentError> {
        let idx = Self::index("FDwfDeviceOpen", index)?;
        let mut handle: c_int = 0;
        let ok = unsafe { (self.api.device_open)(idx, &mut handle) };
        self.check("FDwfDeviceOpen", ok)?;
        Ok(DeviceHandle(handle))
    }

    fn close(&mut self, handle: DeviceHandle) {
        let ok = unsafe { (self.api.device_close)(handle.0) };
        if let Err(e) = self.check("FDwfDeviceClose", ok) {
            warn!("{}", e);
        }
    }

    fn channel_count(&mut self, handle: DeviceHandle) -> Result<usize, InstrumentError> {
        let mut n: c_int = 0;
        let ok = unsafe { (self.api.channel_count)(handle.0, &mut n) };
        self.check("FDwfAnalogInChannelCount", ok)?;
        Ok(n.max(0) as usize)
    }

    fn configure_channel(
        &mut self,
        handle: DeviceHandle,
        channel: &ChannelConfig,
    ) -> Result<(), InstrumentError> {
        let idx = Self::index("FDwfAnalogInChannelEnableSet", channel.index)?;
        let ok = unsafe { (self.api.channel_enable)(handle.0, idx, channel.enabled as c_int) };
        self.check("FDwfAnalogInChannelEnableSet", ok)?;
        if !channel.enabled {
            return Ok(());
        }
        let ok = unsafe { (self.api.channel_range)(handle.0, idx, channel.range_volts) };
        self.check("FDwfAnalogInChannelRangeSet", ok)?;
        let ok = unsafe { (self.api.channel_offset)(handle.0, idx, channel.offset_volts) };
        self.check("FDwfAnalogInChannelOffsetSet", ok)
    }

    fn configure_acquisition(
        &mut self,
        handle: DeviceHandle,
        acq: &AcquisitionConfig,
    ) -> Result<(), InstrumentError> {
        let h = handle.0;
        let buffer = Self::index("FDwfAnalogInBufferSizeSet", acq.buffer_size)?;
        unsafe {
            self.check(
                "FDwfAnalogInAcquisitionModeSet",
                (self.api.acquisition_mode)(h, ACQMODE_SINGLE),
            )?;
            self.check(
                "FDwfAnalogInFrequencySet",
                (self.api.frequency)(h, acq.sample_rate_hz),
            )?;
            self.check("FDwfAnalogInBufferSizeSet", (self.api.buffer_size)(h, buffer))?;
        }

        let source = match acq.trigger_source {
            TriggerSource::None => TRIGSRC_NONE,
            TriggerSource::Channel1 | TriggerSource::Channel2 => TRIGSRC_DETECTOR_ANALOG_IN,
            TriggerSource::External => TRIGSRC_EXTERNAL1,
        };
        unsafe {
            self.check(
                "FDwfAnalogInTriggerSourceSet",
                (self.api.trigger_source)(h, source),
            )?;
        }
        if acq.trigger_source == TriggerSource::None {
            return Ok(());
        }

        let condition = match acq.trigger_edge {
            TriggerEdge::Rising => 0,
            TriggerEdge::Falling => 1,
            TriggerEdge::Both => 2,
        };
        unsafe {
            // No auto-trigger: the acquisition loop's own timeout bounds the wait.
            self.check(
                "FDwfAnalogInTriggerAutoTimeoutSet",
                (self.api.trigger_auto_timeout)(h, 0.0),
            )?;
            self.check(
                "FDwfAnalogInTriggerTypeSet",
                (self.api.trigger_type)(h, TRIGTYPE_EDGE),
            )?;
            if let Some(channel) = acq.trigger_source.channel() {
                self.check(
                    "FDwfAnalogInTriggerChannelSet",
                    (self.api.trigger_channel)(h, channel as c_int),
                )?;
            }
            self.check(
                "FDwfAnalogInTriggerLevelSet",
                (self.api.trigger_level)(h, acq.trigger_level_volts),
            )?;
            self.check(
                "FDwfAnalogInTriggerConditionSet",
                (self.api.trigger_condition)(h, condition),
            )
        }
    }

    fn arm(&mut self, handle: DeviceHandle) -> Result<(), InstrumentError> {
        let ok = unsafe { (self.api.configure)(handle.0, 1, 1) };
        self.check("FDwfAnalogInConfigure", ok)
    }

    fn status(&mut self, handle: DeviceHandle) -> Result<CaptureStatus, InstrumentError> {
        let mut state: c_uchar = 0;
        let ok = unsafe { (self.api.status)(handle.0, 1, &mut state) };
        self.check("FDwfAnalogInStatus", ok)?;
        Ok(CaptureStatus::from(state))
    }

    fn read(
        &mut self,
        handle: DeviceHandle,
        channel: usize,
        dest: &mut [f64],
    ) -> Result<usize, InstrumentError> {
        let idx = Self::index("FDwfAnalogInStatusData", channel)?;
        let mut valid: c_int = 0;
        let ok = unsafe { (self.api.samples_valid)(handle.0, &mut valid) };
        self.check("FDwfAnalogInStatusSamplesValid", ok)?;
        let n = (valid.max(0) as usize).min(dest.len());
        if n == 0 {
            return Ok(0);
        }
        let ok = unsafe { (self.api.status_data)(handle.0, idx, dest.as_mut_ptr(), n as c_int) };
        self.check("FDwfAnalogInStatusData", ok)?;
        Ok(n)
    }

    fn abort(&mut self, handle: DeviceHandle) -> Result<(), InstrumentError> {
        let ok = unsafe { (self.api.configure)(handle.0, 0, 0) };
        self.check("FDwfAnalogInConfigure", ok)
    }
}
