//! The command protocol. Every observable action the interpreter takes is
//! one [Command] record, handed to the host's callback synchronously before
//! execution advances. Commands serialize to JSON with `type` first, then
//! `seq` and `ts`, then the type-specific keys in declaration order —
//! serde's internally-tagged representation and struct-field ordering give
//! exactly the wire layout the protocol defines.

use serde::Serialize;

/// Host callback invoked once per emitted command, on the interpreter
/// thread. It must not re-enter the interpreter's execution operations;
/// control requests (`pause`, `reset`) are flags and are safe.
pub type CommandCallback = Box<dyn FnMut(&Command)>;

/// One observable action or data request.
///
/// `seq` starts at 1 and is strictly monotonic and contiguous within a run.
/// `ts` is the interpreter-relative millisecond clock: it starts at 0 and is
/// advanced only by `delay`/`delayMicroseconds`, never by wall time, so
/// identical inputs produce byte-identical streams.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    VersionInfo {
        seq: u32,
        ts: u32,
        version: String,
        component: String,
    },
    ProgramStart {
        seq: u32,
        ts: u32,
    },
    SetupStart {
        seq: u32,
        ts: u32,
    },
    SetupEnd {
        seq: u32,
        ts: u32,
    },
    LoopStart {
        seq: u32,
        ts: u32,
        iteration: u32,
    },
    LoopEnd {
        seq: u32,
        ts: u32,
        iteration: u32,
    },
    ProgramEnd {
        seq: u32,
        ts: u32,
        reason: String,
    },
    Error {
        seq: u32,
        ts: u32,
        kind: String,
        message: String,
        node: u32,
    },
    PinMode {
        seq: u32,
        ts: u32,
        pin: i32,
        mode: i32,
    },
    DigitalWrite {
        seq: u32,
        ts: u32,
        pin: i32,
        value: i32,
    },
    AnalogWrite {
        seq: u32,
        ts: u32,
        pin: i32,
        value: i32,
    },
    Delay {
        seq: u32,
        ts: u32,
        ms: u32,
    },
    DelayMicroseconds {
        seq: u32,
        ts: u32,
        us: u32,
    },
    Tone {
        seq: u32,
        ts: u32,
        pin: i32,
        frequency: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u32>,
    },
    NoTone {
        seq: u32,
        ts: u32,
        pin: i32,
    },
    AttachInterrupt {
        seq: u32,
        ts: u32,
        pin: i32,
        mode: i32,
    },
    DetachInterrupt {
        seq: u32,
        ts: u32,
        pin: i32,
    },
    SerialBegin {
        seq: u32,
        ts: u32,
        baud: i32,
    },
    SerialEnd {
        seq: u32,
        ts: u32,
    },
    SerialFlush {
        seq: u32,
        ts: u32,
    },
    SerialPrint {
        seq: u32,
        ts: u32,
        value: String,
    },
    SerialPrintln {
        seq: u32,
        ts: u32,
        value: String,
    },
    SerialWrite {
        seq: u32,
        ts: u32,
        value: i32,
    },
    AnalogReadRequest {
        seq: u32,
        ts: u32,
        pin: i32,
        #[serde(rename = "requestId")]
        request_id: String,
    },
    DigitalReadRequest {
        seq: u32,
        ts: u32,
        pin: i32,
        #[serde(rename = "requestId")]
        request_id: String,
    },
    MillisRequest {
        seq: u32,
        ts: u32,
        #[serde(rename = "requestId")]
        request_id: String,
    },
    MicrosRequest {
        seq: u32,
        ts: u32,
        #[serde(rename = "requestId")]
        request_id: String,
    },
    #[serde(rename = "PULSEIN_REQUEST")]
    PulseInRequest {
        seq: u32,
        ts: u32,
        pin: i32,
        state: i32,
        timeout: u32,
        #[serde(rename = "requestId")]
        request_id: String,
    },
    LibrarySensorRequest {
        seq: u32,
        ts: u32,
        library: String,
        method: String,
        arg: i32,
        #[serde(rename = "requestId")]
        request_id: String,
    },
}

impl Command {
    /// The wire `type` string for this command.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VersionInfo { .. } => "VERSION_INFO",
            Self::ProgramStart { .. } => "PROGRAM_START",
            Self::SetupStart { .. } => "SETUP_START",
            Self::SetupEnd { .. } => "SETUP_END",
            Self::LoopStart { .. } => "LOOP_START",
            Self::LoopEnd { .. } => "LOOP_END",
            Self::ProgramEnd { .. } => "PROGRAM_END",
            Self::Error { .. } => "ERROR",
            Self::PinMode { .. } => "PIN_MODE",
            Self::DigitalWrite { .. } => "DIGITAL_WRITE",
            Self::AnalogWrite { .. } => "ANALOG_WRITE",
            Self::Delay { .. } => "DELAY",
            Self::DelayMicroseconds { .. } => "DELAY_MICROSECONDS",
            Self::Tone { .. } => "TONE",
            Self::NoTone { .. } => "NO_TONE",
            Self::AttachInterrupt { .. } => "ATTACH_INTERRUPT",
            Self::DetachInterrupt { .. } => "DETACH_INTERRUPT",
            Self::SerialBegin { .. } => "SERIAL_BEGIN",
            Self::SerialEnd { .. } => "SERIAL_END",
            Self::SerialFlush { .. } => "SERIAL_FLUSH",
            Self::SerialPrint { .. } => "SERIAL_PRINT",
            Self::SerialPrintln { .. } => "SERIAL_PRINTLN",
            Self::SerialWrite { .. } => "SERIAL_WRITE",
            Self::AnalogReadRequest { .. } => "ANALOG_READ_REQUEST",
            Self::DigitalReadRequest { .. } => "DIGITAL_READ_REQUEST",
            Self::MillisRequest { .. } => "MILLIS_REQUEST",
            Self::MicrosRequest { .. } => "MICROS_REQUEST",
            Self::PulseInRequest { .. } => "PULSEIN_REQUEST",
            Self::LibrarySensorRequest { .. } => "LIBRARY_SENSOR_REQUEST",
        }
    }

    /// The command's sequence number.
    pub fn seq(&self) -> u32 {
        match self {
            Self::VersionInfo { seq, .. }
            | Self::ProgramStart { seq, .. }
            | Self::SetupStart { seq, .. }
            | Self::SetupEnd { seq, .. }
            | Self::LoopStart { seq, .. }
            | Self::LoopEnd { seq, .. }
            | Self::ProgramEnd { seq, .. }
            | Self::Error { seq, .. }
            | Self::PinMode { seq, .. }
            | Self::DigitalWrite { seq, .. }
            | Self::AnalogWrite { seq, .. }
            | Self::Delay { seq, .. }
            | Self::DelayMicroseconds { seq, .. }
            | Self::Tone { seq, .. }
            | Self::NoTone { seq, .. }
            | Self::AttachInterrupt { seq, .. }
            | Self::DetachInterrupt { seq, .. }
            | Self::SerialBegin { seq, .. }
            | Self::SerialEnd { seq, .. }
            | Self::SerialFlush { seq, .. }
            | Self::SerialPrint { seq, .. }
            | Self::SerialPrintln { seq, .. }
            | Self::SerialWrite { seq, .. }
            | Self::AnalogReadRequest { seq, .. }
            | Self::DigitalReadRequest { seq, .. }
            | Self::MillisRequest { seq, .. }
            | Self::MicrosRequest { seq, .. }
            | Self::PulseInRequest { seq, .. }
            | Self::LibrarySensorRequest { seq, .. } => *seq,
        }
    }

    /// Serialize to the wire JSON form. The command types here cannot fail
    /// to serialize.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("command serialization")
    }
}
