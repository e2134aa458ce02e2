//! Various Utility and Helper functions used across the daemon.

use std::{
    collections::HashMap,
    io::{Read, Write},
    net::TcpStream,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bitcoin::{
    secp256k1::{
        rand::{rngs::OsRng, RngCore},
        Secp256k1, SecretKey,
    },
    PublicKey,
};

use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

use crate::error::NetError;

/// Confirmation threshold after which a funding output is considered final.
pub const REQUIRED_CONFIRMS: u32 = 1;

/// Fallback fee rate (sat/vB) used when the backend cannot provide an estimate.
pub const DEFAULT_TX_FEE_RATE: u64 = 2;

/// Interval of the coordinator's housekeeping loop (confirmation polls, timeout sweep).
#[cfg(feature = "integration-test")]
pub const HEART_BEAT_INTERVAL_SECS: u64 = 1;
#[cfg(not(feature = "integration-test"))]
pub const HEART_BEAT_INTERVAL_SECS: u64 = 3;

/// Upper bound for a single network frame. Anything bigger is a protocol violation.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Generate a fresh secp256k1 keypair from the OS rng.
pub fn generate_keypair() -> (PublicKey, SecretKey) {
    let mut privkey = [0u8; 32];
    OsRng.fill_bytes(&mut privkey);
    let secp = Secp256k1::new();
    let privkey = SecretKey::from_slice(&privkey).expect("random bytes in range");
    let pubkey = PublicKey {
        compressed: true,
        inner: bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &privkey),
    };
    (pubkey, privkey)
}

/// Generate a random 32-byte hashlock preimage.
pub fn generate_preimage() -> [u8; 32] {
    let mut preimage = [0u8; 32];
    OsRng.fill_bytes(&mut preimage);
    preimage
}

/// Current unix time in whole seconds.
pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

pub fn to_hex(bytes: &[u8]) -> String {
    let hex_chars: Vec<char> = "0123456789abcdef".chars().collect();
    let mut hex_string = String::new();

    for &byte in bytes {
        let high_nibble = (byte >> 4) & 0xF;
        let low_nibble = byte & 0xF;
        hex_string.push(hex_chars[high_nibble as usize]);
        hex_string.push(hex_chars[low_nibble as usize]);
    }

    hex_string
}

/// Decode a hex string. Rejects odd lengths and non-hex characters.
pub fn from_hex(hex: &str) -> Result<Vec<u8>, &'static str> {
    if hex.len() % 2 != 0 {
        return Err("hex string with odd length");
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let chars = hex.as_bytes();
    for pair in chars.chunks(2) {
        let nibble = |c: u8| -> Result<u8, &'static str> {
            match c {
                b'0'..=b'9' => Ok(c - b'0'),
                b'a'..=b'f' => Ok(c - b'a' + 10),
                b'A'..=b'F' => Ok(c - b'A' + 10),
                _ => Err("non-hex character"),
            }
        };
        bytes.push((nibble(pair[0])? << 4) | nibble(pair[1])?);
    }
    Ok(bytes)
}

/// Decode a hex string into a fixed-size array.
pub fn from_hex_array<const N: usize>(hex: &str) -> Result<[u8; N], &'static str> {
    let bytes = from_hex(hex)?;
    bytes.try_into().map_err(|_| "hex string with wrong length")
}

/// Send a length-prefixed JSON message over a socket.
/// The frame is a u32 big-endian byte count followed by the serialized body.
pub fn send_message(socket: &mut TcpStream, message: &impl serde::Serialize) -> Result<(), NetError> {
    let body = serde_json::to_vec(message)?;
    let length = body.len() as u32;
    if length > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge(length));
    }
    socket.write_all(&length.to_be_bytes())?;
    socket.write_all(&body)?;
    socket.flush()?;
    Ok(())
}

/// Read one length-prefixed JSON message from a socket.
pub fn read_message<T: serde::de::DeserializeOwned>(socket: &mut TcpStream) -> Result<T, NetError> {
    let mut length_bytes = [0u8; 4];
    socket.read_exact(&mut length_bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NetError::ReachedEOF
        } else {
            NetError::IO(e)
        }
    })?;
    let length = u32::from_be_bytes(length_bytes);
    if length > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge(length));
    }
    let mut buffer = vec![0u8; length as usize];
    socket.read_exact(&mut buffer)?;
    Ok(serde_json::from_slice(&buffer)?)
}

/// Parse a flat `key = value` TOML file into a map. Section headers and
/// comments are skipped; values keep their raw string form.
pub fn parse_toml(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok(map)
}

/// Parse a TOML file of `[section]` blocks into per-section key/value maps,
/// preserving section order. Keys before the first section are ignored.
pub fn parse_toml_sections(path: &Path) -> std::io::Result<Vec<(String, HashMap<String, String>)>> {
    let content = std::fs::read_to_string(path)?;
    let mut sections: Vec<(String, HashMap<String, String>)> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push((name.trim().to_string(), HashMap::new()));
            continue;
        }
        if let (Some((key, value)), Some((_, map))) = (line.split_once('='), sections.last_mut()) {
            map.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok(sections)
}

/// Parse a single config field, falling back to the default on absence or parse failure.
pub fn parse_field<T: std::str::FromStr>(value: Option<&String>, default: T) -> T {
    value
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// Root data directory: `~/.crosswap`.
pub fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory expected")
        .join(".crosswap")
}

/// Data directory of the swap daemon: `~/.crosswap/swapd`.
pub fn get_swapd_dir() -> PathBuf {
    get_data_dir().join("swapd")
}

/// Initializes a log4rs logger with a console appender and a rolling
/// debug log file under the given data directory.
pub fn setup_logger(filter: log::LevelFilter, data_dir: Option<PathBuf>) {
    let data_dir = data_dir.unwrap_or_else(get_swapd_dir);
    let log_path = data_dir.join("debug.log");

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} {h({l})} {m}{n}")))
        .build();

    let config = match FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} {l} {M}: {m}{n}")))
        .build(log_path)
    {
        Ok(file) => Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .appender(Appender::builder().build("file", Box::new(file)))
            .build(
                Root::builder()
                    .appender("stdout")
                    .appender("file")
                    .build(filter),
            ),
        Err(_) => Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(filter)),
    };

    if let Ok(config) = config {
        // A second init (tests, embedded use) keeps the first logger.
        let _ = log4rs::init_config(config);
    }
}

/// Serde adapter storing 128-bit amounts as decimal strings, which keeps
/// both the JSON wire format and the CBOR store format portable.
pub mod amount_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u128>().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex_empty_bytes() {
        let bytes: Vec<u8> = Vec::new();
        assert_eq!(to_hex(&bytes), "");
    }

    #[test]
    fn test_to_hex_multiple_bytes() {
        let bytes: Vec<u8> = vec![0x12, 0x34, 0x56, 0xFF];
        assert_eq!(to_hex(&bytes), "123456ff");
    }

    #[test]
    fn test_hex_roundtrip() {
        let bytes = vec![0x00, 0xde, 0xad, 0xbe, 0xef, 0x7f];
        assert_eq!(from_hex(&to_hex(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(from_hex("abc").is_err());
        assert!(from_hex("zz").is_err());
        assert!(from_hex_array::<4>("001122").is_err());
    }

    #[test]
    fn test_keypair_generation_is_compressed() {
        let (pubkey, _) = generate_keypair();
        assert!(pubkey.compressed);
        assert_eq!(pubkey.to_bytes().len(), 33);
    }

    #[test]
    fn test_parse_field_fallback() {
        let present = "6102".to_string();
        assert_eq!(parse_field(Some(&present), 0u16), 6102);
        let garbage = "not_a_number".to_string();
        assert_eq!(parse_field(Some(&garbage), 7u16), 7);
        assert_eq!(parse_field::<u16>(None, 9), 9);
    }

    #[test]
    fn test_amount_string_roundtrip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrap {
            #[serde(with = "amount_string")]
            amount: u128,
        }
        let wrap = Wrap {
            amount: 1_000_000_000_000_000_000u128,
        };
        let json = serde_json::to_string(&wrap).unwrap();
        assert_eq!(json, "{\"amount\":\"1000000000000000000\"}");
        let back: Wrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, wrap.amount);
    }
}
