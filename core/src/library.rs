//! The Arduino library registry: the built-in functions and objects a
//! sketch can call, classified as *internal* (computed locally, no command)
//! or *external* (an observable side effect, or a world-read that emits a
//! request command and blocks on the data provider).
//!
//! The internal/external split mirrors the reference interpreter's registry
//! table exactly — command-stream parity depends on it. Unknown names fall
//! through to user-defined-function lookup in the interpreter core.

use crate::error::RuntimeError;
use crate::value::{NumericPair, Value};
use std::convert::TryFrom;

/// The predeclared global constants every sketch sees.
pub(crate) fn constants() -> Vec<(&'static str, Value)> {
    vec![
        ("HIGH", Value::Int(1)),
        ("LOW", Value::Int(0)),
        ("INPUT", Value::Int(0)),
        ("OUTPUT", Value::Int(1)),
        ("INPUT_PULLUP", Value::Int(2)),
        ("LED_BUILTIN", Value::Int(13)),
        ("A0", Value::Int(14)),
        ("A1", Value::Int(15)),
        ("A2", Value::Int(16)),
        ("A3", Value::Int(17)),
        ("A4", Value::Int(18)),
        ("A5", Value::Int(19)),
        ("A6", Value::Int(20)),
        ("A7", Value::Int(21)),
        ("CHANGE", Value::Int(1)),
        ("FALLING", Value::Int(2)),
        ("RISING", Value::Int(3)),
        ("PI", Value::Double(std::f64::consts::PI)),
        ("HALF_PI", Value::Double(std::f64::consts::FRAC_PI_2)),
        ("TWO_PI", Value::Double(std::f64::consts::PI * 2.0)),
        ("DEG_TO_RAD", Value::Double(std::f64::consts::PI / 180.0)),
        ("RAD_TO_DEG", Value::Double(180.0 / std::f64::consts::PI)),
    ]
}

/// Library object types whose value-returning methods resolve to
/// `LIBRARY_SENSOR_REQUEST` and the provider's sensor read.
pub(crate) fn is_sensor_library(type_name: &str) -> bool {
    matches!(type_name, "CapacitiveSensor" | "DHT" | "Ultrasonic")
}

/// Deterministic linear congruential generator backing `random()`. A fixed
/// default seed (and explicit `randomSeed`) keeps command streams
/// reproducible across runs.
#[derive(Clone, Debug)]
pub(crate) struct Lcg {
    state: u64,
}

impl Lcg {
    pub fn new() -> Self {
        Self { state: 1 }
    }

    pub fn reseed(&mut self, seed: u32) {
        self.state = u64::from(seed.max(1));
    }

    fn next(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 33) as u32
    }

    /// A value in `[low, high)`, matching Arduino's `random(min, max)`.
    fn in_range(&mut self, low: i32, high: i32) -> i32 {
        if high <= low {
            return low;
        }
        let span = (high as i64 - low as i64) as u64;
        low.wrapping_add((u64::from(self.next()) % span) as i32)
    }
}

/// An external call resolved by the registry: what the interpreter should
/// emit, and for value-returning reads, which provider method answers it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ExternalCall {
    PinMode { pin: i32, mode: i32 },
    DigitalWrite { pin: i32, value: i32 },
    AnalogWrite { pin: i32, value: i32 },
    Delay { ms: u32 },
    DelayMicroseconds { us: u32 },
    Tone {
        pin: i32,
        frequency: i32,
        duration: Option<u32>,
    },
    NoTone { pin: i32 },
    AttachInterrupt { pin: i32, mode: i32 },
    DetachInterrupt { pin: i32 },
    SerialBegin { baud: i32 },
    SerialEnd,
    SerialFlush,
    SerialPrint { value: String },
    SerialPrintln { value: String },
    SerialWrite { value: i32 },
    Request(RequestKind),
}

/// The ordered set of data-request kinds.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RequestKind {
    AnalogRead { pin: i32 },
    DigitalRead { pin: i32 },
    Millis,
    Micros,
    PulseIn {
        pin: i32,
        state: i32,
        timeout: u32,
    },
    LibrarySensor {
        library: String,
        method: String,
        arg: i32,
    },
}

fn arg_i32(args: &[Value], index: usize) -> Result<i32, RuntimeError> {
    args.get(index).map(Value::as_i32).transpose().map(|v| {
        v.unwrap_or(0)
    })
}

fn arg_u32(args: &[Value], index: usize) -> Result<u32, RuntimeError> {
    args.get(index).map(Value::as_u32).transpose().map(|v| {
        v.unwrap_or(0)
    })
}

fn arg_f64(args: &[Value], index: usize) -> Result<f64, RuntimeError> {
    args.get(index).map(Value::as_f64).transpose().map(|v| {
        v.unwrap_or(0.0)
    })
}

fn arg_str(args: &[Value], index: usize) -> String {
    args.get(index).map(Value::to_string).unwrap_or_default()
}

/// Resolve an external (command-emitting) call. `object` is `Some` for
/// method calls like `Serial.print`. Returns `None` if the name isn't an
/// external library entry.
pub(crate) fn external(
    object: Option<&str>,
    method: &str,
    args: &[Value],
) -> Option<Result<ExternalCall, RuntimeError>> {
    let call = match (object, method) {
        (None, "pinMode") => try_call(|| {
            Ok(ExternalCall::PinMode {
                pin: arg_i32(args, 0)?,
                mode: arg_i32(args, 1)?,
            })
        }),
        (None, "digitalWrite") => try_call(|| {
            Ok(ExternalCall::DigitalWrite {
                pin: arg_i32(args, 0)?,
                value: arg_i32(args, 1)?,
            })
        }),
        (None, "analogWrite") => try_call(|| {
            Ok(ExternalCall::AnalogWrite {
                pin: arg_i32(args, 0)?,
                value: arg_i32(args, 1)?,
            })
        }),
        (None, "delay") => try_call(|| {
            Ok(ExternalCall::Delay {
                ms: arg_u32(args, 0)?,
            })
        }),
        (None, "delayMicroseconds") => try_call(|| {
            Ok(ExternalCall::DelayMicroseconds {
                us: arg_u32(args, 0)?,
            })
        }),
        (None, "tone") => try_call(|| {
            Ok(ExternalCall::Tone {
                pin: arg_i32(args, 0)?,
                frequency: arg_i32(args, 1)?,
                duration: if args.len() > 2 {
                    Some(arg_u32(args, 2)?)
                } else {
                    None
                },
            })
        }),
        (None, "noTone") => try_call(|| {
            Ok(ExternalCall::NoTone {
                pin: arg_i32(args, 0)?,
            })
        }),
        (None, "attachInterrupt") => try_call(|| {
            Ok(ExternalCall::AttachInterrupt {
                pin: arg_i32(args, 0)?,
                mode: arg_i32(args, 2)?,
            })
        }),
        (None, "detachInterrupt") => try_call(|| {
            Ok(ExternalCall::DetachInterrupt {
                pin: arg_i32(args, 0)?,
            })
        }),
        (None, "analogRead") => try_call(|| {
            Ok(ExternalCall::Request(RequestKind::AnalogRead {
                pin: arg_i32(args, 0)?,
            }))
        }),
        (None, "digitalRead") => try_call(|| {
            Ok(ExternalCall::Request(RequestKind::DigitalRead {
                pin: arg_i32(args, 0)?,
            }))
        }),
        (None, "millis") => Ok(ExternalCall::Request(RequestKind::Millis)),
        (None, "micros") => Ok(ExternalCall::Request(RequestKind::Micros)),
        (None, "pulseIn") => try_call(|| {
            Ok(ExternalCall::Request(RequestKind::PulseIn {
                pin: arg_i32(args, 0)?,
                state: arg_i32(args, 1)?,
                timeout: arg_u32(args, 2)?,
            }))
        }),
        (Some("Serial"), "begin") => try_call(|| {
            Ok(ExternalCall::SerialBegin {
                baud: arg_i32(args, 0)?,
            })
        }),
        (Some("Serial"), "end") => Ok(ExternalCall::SerialEnd),
        (Some("Serial"), "flush") => Ok(ExternalCall::SerialFlush),
        (Some("Serial"), "print") => Ok(ExternalCall::SerialPrint {
            value: arg_str(args, 0),
        }),
        (Some("Serial"), "println") => Ok(ExternalCall::SerialPrintln {
            value: arg_str(args, 0),
        }),
        (Some("Serial"), "write") => try_call(|| {
            Ok(ExternalCall::SerialWrite {
                value: arg_i32(args, 0)?,
            })
        }),
        _ => return None,
    };
    Some(call)
}

fn try_call(
    f: impl FnOnce() -> Result<ExternalCall, RuntimeError>,
) -> Result<ExternalCall, RuntimeError> {
    f()
}

/// Resolve and compute an internal (pure) library function. Returns `None`
/// if the name isn't an internal entry.
pub(crate) fn internal(
    method: &str,
    args: &[Value],
    rng: &mut Lcg,
) -> Option<Result<Value, RuntimeError>> {
    let result = match method {
        "min" => pick(args, |a, b| a <= b),
        "max" => pick(args, |a, b| a >= b),
        "abs" => try_value(|| match args.first() {
            Some(Value::Double(d)) => Ok(Value::Double(d.abs())),
            _ => Ok(Value::Int(arg_i32(args, 0)?.wrapping_abs())),
        }),
        "constrain" => try_value(|| {
            let x = args.first().cloned().unwrap_or(Value::Int(0));
            let low = args.get(1).cloned().unwrap_or(Value::Int(0));
            let high = args.get(2).cloned().unwrap_or(Value::Int(0));
            if numeric_lt(&x, &low)? {
                Ok(low)
            } else if numeric_lt(&high, &x)? {
                Ok(high)
            } else {
                Ok(x)
            }
        }),
        "map" => try_value(|| {
            let x = i64::from(arg_i32(args, 0)?);
            let in_min = i64::from(arg_i32(args, 1)?);
            let in_max = i64::from(arg_i32(args, 2)?);
            let out_min = i64::from(arg_i32(args, 3)?);
            let out_max = i64::from(arg_i32(args, 4)?);
            if in_max == in_min {
                return Err(RuntimeError::DivideByZero);
            }
            let mapped = (x - in_min) * (out_max - out_min)
                / (in_max - in_min)
                + out_min;
            Ok(Value::Int(mapped as i32))
        }),
        "pow" => try_value(|| {
            Ok(Value::Double(arg_f64(args, 0)?.powf(arg_f64(args, 1)?)))
        }),
        "sqrt" => try_value(|| Ok(Value::Double(arg_f64(args, 0)?.sqrt()))),
        "sq" => try_value(|| match args.first() {
            Some(Value::Double(d)) => Ok(Value::Double(d * d)),
            _ => {
                let x = arg_i32(args, 0)?;
                Ok(Value::Int(x.wrapping_mul(x)))
            }
        }),
        "sin" => try_value(|| Ok(Value::Double(arg_f64(args, 0)?.sin()))),
        "cos" => try_value(|| Ok(Value::Double(arg_f64(args, 0)?.cos()))),
        "tan" => try_value(|| Ok(Value::Double(arg_f64(args, 0)?.tan()))),
        "floor" => try_value(|| Ok(Value::Double(arg_f64(args, 0)?.floor()))),
        "ceil" => try_value(|| Ok(Value::Double(arg_f64(args, 0)?.ceil()))),
        "round" => try_value(|| {
            Ok(Value::Int(arg_f64(args, 0)?.round() as i32))
        }),
        "degrees" => try_value(|| {
            Ok(Value::Double(arg_f64(args, 0)?.to_degrees()))
        }),
        "radians" => try_value(|| {
            Ok(Value::Double(arg_f64(args, 0)?.to_radians()))
        }),
        "random" => try_value(|| {
            let value = if args.len() >= 2 {
                let low = arg_i32(args, 0)?;
                let high = arg_i32(args, 1)?;
                rng.in_range(low, high)
            } else {
                rng.in_range(0, arg_i32(args, 0)?)
            };
            Ok(Value::Int(value))
        }),
        "randomSeed" => try_value(|| {
            rng.reseed(arg_u32(args, 0)?);
            Ok(Value::Void)
        }),
        "bit" => try_value(|| {
            Ok(Value::Int(1i32.wrapping_shl(arg_u32(args, 0)?)))
        }),
        "bitRead" => try_value(|| {
            let x = arg_i32(args, 0)?;
            let n = arg_u32(args, 1)?;
            Ok(Value::Int((x >> (n & 31)) & 1))
        }),
        "bitWrite" => try_value(|| {
            let x = arg_i32(args, 0)?;
            let n = arg_u32(args, 1)? & 31;
            let b = arg_i32(args, 2)? != 0;
            Ok(Value::Int(if b { x | (1 << n) } else { x & !(1 << n) }))
        }),
        "bitSet" => try_value(|| {
            let x = arg_i32(args, 0)?;
            let n = arg_u32(args, 1)? & 31;
            Ok(Value::Int(x | (1 << n)))
        }),
        "bitClear" => try_value(|| {
            let x = arg_i32(args, 0)?;
            let n = arg_u32(args, 1)? & 31;
            Ok(Value::Int(x & !(1 << n)))
        }),
        "lowByte" => try_value(|| Ok(Value::Int(arg_i32(args, 0)? & 0xFF))),
        "highByte" => try_value(|| {
            Ok(Value::Int((arg_i32(args, 0)? >> 8) & 0xFF))
        }),
        "isDigit" => char_class(args, |c| c.is_ascii_digit()),
        "isAlpha" => char_class(args, |c| c.is_ascii_alphabetic()),
        "isAlphaNumeric" => char_class(args, |c| c.is_ascii_alphanumeric()),
        "isSpace" => char_class(args, |c| c.is_ascii_whitespace()),
        "isUpperCase" => char_class(args, |c| c.is_ascii_uppercase()),
        "isLowerCase" => char_class(args, |c| c.is_ascii_lowercase()),
        _ => return None,
    };
    Some(result)
}

fn try_value(
    f: impl FnOnce() -> Result<Value, RuntimeError>,
) -> Result<Value, RuntimeError> {
    f()
}

/// min/max over the first two arguments, preserving double-ness.
fn pick(
    args: &[Value],
    keep_first: impl Fn(f64, f64) -> bool,
) -> Result<Value, RuntimeError> {
    let a = args.first().cloned().unwrap_or(Value::Int(0));
    let b = args.get(1).cloned().unwrap_or(Value::Int(0));
    if keep_first(a.as_f64()?, b.as_f64()?) {
        Ok(a)
    } else {
        Ok(b)
    }
}

fn numeric_lt(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    Ok(match Value::promote(a, b)? {
        NumericPair::Int(x, y) => x < y,
        NumericPair::UInt(x, y) => x < y,
        NumericPair::Double(x, y) => x < y,
    })
}

fn char_class(
    args: &[Value],
    test: impl Fn(char) -> bool,
) -> Result<Value, RuntimeError> {
    let c = arg_i32(args, 0)?;
    let c = u8::try_from(c).map(char::from).unwrap_or('\0');
    Ok(Value::Bool(test(c)))
}

/// The outcome of an Arduino `String` method: the expression's value plus,
/// for the in-place mutators (`toUpperCase`, `trim`, ...), the receiver's
/// new contents to write back.
pub(crate) struct StringMethodOutcome {
    pub value: Value,
    pub mutated: Option<String>,
}

impl StringMethodOutcome {
    fn value(value: Value) -> Self {
        Self {
            value,
            mutated: None,
        }
    }

    fn mutate(value: Value, receiver: String) -> Self {
        Self {
            value,
            mutated: Some(receiver),
        }
    }
}

/// Resolve and compute an Arduino `String` method against `recv`. Returns
/// `None` for unknown method names.
pub(crate) fn string_method(
    recv: &str,
    method: &str,
    args: &[Value],
) -> Option<Result<StringMethodOutcome, RuntimeError>> {
    let result = match method {
        "length" => Ok(StringMethodOutcome::value(Value::Int(
            recv.len() as i32
        ))),
        "charAt" => try_string(|| {
            let i = arg_i32(args, 0)?;
            let c = usize::try_from(i)
                .ok()
                .and_then(|i| recv.as_bytes().get(i))
                .copied()
                .unwrap_or(0);
            Ok(StringMethodOutcome::value(Value::Str(
                (c as char).to_string(),
            )))
        }),
        "substring" => try_string(|| {
            let from = arg_i32(args, 0)?.max(0) as usize;
            let to = if args.len() > 1 {
                arg_i32(args, 1)?.max(0) as usize
            } else {
                recv.len()
            };
            let from = from.min(recv.len());
            let to = to.clamp(from, recv.len());
            Ok(StringMethodOutcome::value(Value::Str(
                recv[from..to].to_string(),
            )))
        }),
        "indexOf" => {
            let needle = arg_str(args, 0);
            let index = recv
                .find(&needle)
                .map(|i| i as i32)
                .unwrap_or(-1);
            Ok(StringMethodOutcome::value(Value::Int(index)))
        }
        "toInt" => Ok(StringMethodOutcome::value(Value::Int(
            recv.trim().parse().unwrap_or(0),
        ))),
        "toFloat" => Ok(StringMethodOutcome::value(Value::Double(
            recv.trim().parse().unwrap_or(0.0),
        ))),
        "equals" => Ok(StringMethodOutcome::value(Value::Bool(
            recv == arg_str(args, 0),
        ))),
        "startsWith" => Ok(StringMethodOutcome::value(Value::Bool(
            recv.starts_with(&arg_str(args, 0)),
        ))),
        "endsWith" => Ok(StringMethodOutcome::value(Value::Bool(
            recv.ends_with(&arg_str(args, 0)),
        ))),
        // In-place mutators: the call itself is void (or bool), the
        // receiver is rewritten.
        "toUpperCase" => Ok(StringMethodOutcome::mutate(
            Value::Void,
            recv.to_ascii_uppercase(),
        )),
        "toLowerCase" => Ok(StringMethodOutcome::mutate(
            Value::Void,
            recv.to_ascii_lowercase(),
        )),
        "trim" => Ok(StringMethodOutcome::mutate(
            Value::Void,
            recv.trim().to_string(),
        )),
        "replace" => Ok(StringMethodOutcome::mutate(
            Value::Void,
            recv.replace(&arg_str(args, 0), &arg_str(args, 1)),
        )),
        "concat" => Ok(StringMethodOutcome::mutate(
            Value::Bool(true),
            format!("{}{}", recv, arg_str(args, 0)),
        )),
        _ => return None,
    };
    Some(result)
}

fn try_string(
    f: impl FnOnce() -> Result<StringMethodOutcome, RuntimeError>,
) -> Result<StringMethodOutcome, RuntimeError> {
    f()
}
