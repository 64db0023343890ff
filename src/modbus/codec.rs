//! Raw register word <-> typed value conversion.
//!
//! All quantities are big endian on the wire. `word_swap` reverses the word
//! order of multi word integers for devices that transmit the low word first.

use crate::error::{Error, Result};
use crate::models::Value;
use crate::registers::{DataType, RegisterDefinition};

/// Decode raw register words into a typed, scaled value. A gain of 1 keeps
/// integers integral; any other gain divides into a float.
pub fn decode(words: &[u16], data_type: DataType, gain: f64, word_swap: bool) -> Result<Value> {
    if let Some(width) = data_type.width_words() {
        if words.len() != width as usize {
            return Err(Error::Protocol(format!(
                "expected {} words for {:?}, got {}", width, data_type, words.len()
            )));
        }
    }

    let value = match data_type {
        DataType::U16 => scaled_unsigned(u64::from(words[0]), gain),
        DataType::S16 => scaled_signed(i64::from(words[0] as i16), gain),
        DataType::U32 => scaled_unsigned(u64::from(assemble_u32(words, word_swap)), gain),
        DataType::S32 => scaled_signed(i64::from(assemble_u32(words, word_swap) as i32), gain),
        DataType::U64 => scaled_unsigned(assemble_u64(words, word_swap), gain),
        DataType::String => Value::Text(decode_string(words)),
    };
    return Ok(value);
}

/// Encode a value into register words, validating that the scaled result fits
/// the destination width instead of truncating or wrapping.
pub fn encode(value: &Value, def: &RegisterDefinition, word_swap: bool) -> Result<Vec<u16>> {
    if def.data == DataType::String {
        let text = match value {
            Value::Text(t) => t,
            other => {
                return Err(Error::Validation(format!(
                    "register {} expects a string, got {:?}", def.name, other
                )))
            }
        };
        return encode_string(text, def);
    }

    let scaled = match value.as_f64() {
        Some(v) => v * def.gain,
        None => {
            return Err(Error::Validation(format!(
                "register {} expects a number, got {:?}", def.name, value
            )))
        }
    };
    /* NaN would survive the `as i128` cast as 0 and be written out silently */
    if !scaled.is_finite() {
        return Err(Error::Validation(format!(
            "register {} expects a finite number, got {:?}", def.name, value
        )));
    }
    let raw = scaled.round() as i128;

    let words = match def.data {
        DataType::U16 => {
            let raw = check_range(raw, 0, u16::MAX as i128, def)?;
            vec![raw as u16]
        }
        DataType::S16 => {
            let raw = check_range(raw, i16::MIN as i128, i16::MAX as i128, def)?;
            vec![raw as i16 as u16]
        }
        DataType::U32 => {
            let raw = check_range(raw, 0, u32::MAX as i128, def)?;
            split_u32(raw as u32, word_swap)
        }
        DataType::S32 => {
            let raw = check_range(raw, i32::MIN as i128, i32::MAX as i128, def)?;
            split_u32(raw as i32 as u32, word_swap)
        }
        DataType::U64 => {
            let raw = check_range(raw, 0, u64::MAX as i128, def)?;
            split_u64(raw as u64, word_swap)
        }
        DataType::String => unreachable!(),
    };
    return Ok(words);
}

fn scaled_unsigned(raw: u64, gain: f64) -> Value {
    if gain == 1.0 {
        return Value::Uint(raw);
    }
    return Value::Float(raw as f64 / gain);
}

fn scaled_signed(raw: i64, gain: f64) -> Value {
    if gain == 1.0 {
        return Value::Int(raw);
    }
    return Value::Float(raw as f64 / gain);
}

fn check_range(raw: i128, min: i128, max: i128, def: &RegisterDefinition) -> Result<i128> {
    if raw < min || raw > max {
        return Err(Error::Validation(format!(
            "value {} does not fit register {} ({:?}, raw range {}..={})",
            raw, def.name, def.data, min, max
        )));
    }
    return Ok(raw);
}

fn assemble_u32(words: &[u16], word_swap: bool) -> u32 {
    let (hi, lo) = if word_swap { (words[1], words[0]) } else { (words[0], words[1]) };
    return u32::from(hi) << 16 | u32::from(lo);
}

fn split_u32(value: u32, word_swap: bool) -> Vec<u16> {
    let mut words = vec![(value >> 16) as u16, value as u16];
    if word_swap {
        words.reverse();
    }
    return words;
}

fn assemble_u64(words: &[u16], word_swap: bool) -> u64 {
    let mut ordered = [words[0], words[1], words[2], words[3]];
    if word_swap {
        ordered.reverse();
    }
    return ordered.iter().fold(0u64, |acc, w| acc << 16 | u64::from(*w));
}

fn split_u64(value: u64, word_swap: bool) -> Vec<u16> {
    let mut words = vec![
        (value >> 48) as u16,
        (value >> 32) as u16,
        (value >> 16) as u16,
        value as u16,
    ];
    if word_swap {
        words.reverse();
    }
    return words;
}

fn decode_string(words: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        bytes.push((word >> 8) as u8);
        bytes.push(*word as u8);
    }
    let text = String::from_utf8_lossy(&bytes);
    return text.trim_end_matches(['\0', ' ']).to_string();
}

fn encode_string(text: &str, def: &RegisterDefinition) -> Result<Vec<u16>> {
    let bytes = text.as_bytes();
    let capacity = def.count as usize * 2;
    if bytes.len() > capacity {
        return Err(Error::Validation(format!(
            "string of {} bytes does not fit register {} ({} bytes)",
            bytes.len(), def.name, capacity
        )));
    }
    let mut padded = bytes.to_vec();
    padded.resize(capacity, 0);
    let words = padded
        .chunks_exact(2)
        .map(|pair| u16::from(pair[0]) << 8 | u16::from(pair[1]))
        .collect();
    return Ok(words);
}
