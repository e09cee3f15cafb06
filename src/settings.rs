use crate::{enums::*, flags::SettingsFlags, frame::Frame, types::*};
use enum_map::{enum_map, EnumMap};

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// One endpoint's settings record. Each connection holds two: `local` (what
/// we advertised) and `remote` (what the peer advertised).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    map: EnumMap<SettingsParameter, u32>,
}

/// Side effects of applying a peer SETTINGS frame that the engine must
/// propagate beyond the record itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsDelta {
    /// Added to every live stream's send window (may be negative).
    pub initial_window_delta: i64,
    /// New encoder table ceiling, when HEADER_TABLE_SIZE changed.
    pub header_table_size: Option<u32>,
}

impl Default for Settings {
    /// RFC 7540 §6.5.2 initial values: what the peer is assumed to run
    /// until its own SETTINGS frame lands.
    fn default() -> Self {
        Self {
            map: enum_map! {
                SettingsParameter::HeaderTableSize => DEFAULT_HEADER_TABLE_SIZE,
                SettingsParameter::EnablePush => 1,
                SettingsParameter::MaxConcurrentStreams => u32::MAX,
                SettingsParameter::InitialWindowSize => DEFAULT_INITIAL_WINDOW_SIZE,
                SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
                SettingsParameter::MaxHeaderListSize => 0,
            },
        }
    }
}

impl Settings {
    /// What this engine advertises: push disabled, a concurrency cap, the
    /// rest at RFC defaults unless the caller overrides them afterwards.
    #[must_use]
    pub fn advertised() -> Self {
        let mut settings = Self::default();
        settings[SettingsParameter::EnablePush] = 0;
        settings[SettingsParameter::MaxConcurrentStreams] = DEFAULT_MAX_CONCURRENT_STREAMS;
        settings
    }

    /// Applies a peer SETTINGS payload. Validation failures are connection
    /// errors per RFC 7540 §6.5.2.
    pub fn apply(&mut self, params: &[(SettingsParameter, u32)]) -> Result<SettingsDelta, H2Error> {
        let mut delta = SettingsDelta::default();
        for &(param, value) in params {
            match param {
                SettingsParameter::EnablePush if value > 1 => {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "ENABLE_PUSH must be 0 or 1",
                    ));
                }
                SettingsParameter::InitialWindowSize if i64::from(value) > MAX_WINDOW => {
                    return Err(H2Error::connection(
                        ErrorType::FlowControlError,
                        "INITIAL_WINDOW_SIZE above 2^31-1",
                    ));
                }
                SettingsParameter::MaxFrameSize
                    if !(DEFAULT_MAX_FRAME_SIZE..=crate::frame::MAX_ALLOWED_FRAME_SIZE)
                        .contains(&value) =>
                {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "MAX_FRAME_SIZE out of range",
                    ));
                }
                SettingsParameter::InitialWindowSize => {
                    delta.initial_window_delta += i64::from(value) - i64::from(self.map[param]);
                }
                SettingsParameter::HeaderTableSize if value != self.map[param] => {
                    delta.header_table_size = Some(value);
                }
                _ => {}
            }
            self.map[param] = value;
        }
        Ok(delta)
    }

    /// MAX_HEADER_LIST_SIZE with 0 meaning unlimited.
    #[must_use]
    pub fn max_header_list_size(&self) -> Option<usize> {
        match self.map[SettingsParameter::MaxHeaderListSize] {
            0 => None,
            limit => Some(limit as usize),
        }
    }

    /// Non-ACK SETTINGS frame advertising this record.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let params = self
            .map
            .iter()
            .filter(|(param, &value)| {
                // 0 is "unlimited" for the header list cap; don't advertise it
                !matches!(param, SettingsParameter::MaxHeaderListSize) || value != 0
            })
            .map(|(param, &value)| (param, value))
            .collect();
        Frame::Settings {
            flags: SettingsFlags::empty(),
            params,
        }
    }

    #[must_use]
    pub fn ack_frame() -> Frame {
        Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        }
    }
}

impl std::ops::Index<SettingsParameter> for Settings {
    type Output = u32;

    fn index(&self, param: SettingsParameter) -> &u32 {
        &self.map[param]
    }
}

impl std::ops::IndexMut<SettingsParameter> for Settings {
    fn index_mut(&mut self, param: SettingsParameter) -> &mut u32 {
        &mut self.map[param]
    }
}
