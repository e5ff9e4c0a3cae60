use crate::model::error::{Error, KmsError, KmsErrorKind, KmsResult};

pub trait Unicode {
    /// Convert any string into a UTF-16LE byte sequence
    ///
    /// # Example
    /// ```
    /// use kms::model::unicode::Unicode;
    /// let s = String::from("foo");
    /// assert_eq!(s.to_unicode(), [102, 0, 111, 0, 111, 0])
    /// ```
    fn to_unicode(&self) -> Vec<u8>;
}

impl Unicode for String {
    fn to_unicode(&self) -> Vec<u8> {
        let mut result = Vec::new();
        for c in self.encode_utf16() {
            result.extend_from_slice(&c.to_le_bytes());
        }
        result
    }
}

impl Unicode for &str {
    fn to_unicode(&self) -> Vec<u8> {
        self.to_string().to_unicode()
    }
}

/// Decode a fixed width UTF-16LE field
///
/// The string ends at the first NUL code unit; every later
/// code unit up to the fixed width must be zero, a non zero
/// pad yields `MalformedField`.
pub fn from_utf16le_fixed(raw: &[u8]) -> KmsResult<String> {
    if raw.len() % 2 != 0 {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::MalformedField,
            "UTF-16 field with odd byte length",
        )));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let end = units.iter().position(|unit| *unit == 0).unwrap_or(units.len());
    if units[end..].iter().any(|unit| *unit != 0) {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::MalformedField,
            "non zero padding after string terminator",
        )));
    }
    String::from_utf16(&units[..end]).map_err(|_| {
        Error::KmsError(KmsError::new(
            KmsErrorKind::MalformedField,
            "invalid UTF-16 sequence",
        ))
    })
}

/// Decode a fixed width, NUL padded ASCII field
pub fn from_ascii_fixed(raw: &[u8]) -> KmsResult<String> {
    let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
    if raw[end..].iter().any(|byte| *byte != 0) {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::MalformedField,
            "non zero padding after string terminator",
        )));
    }
    if !raw[..end].is_ascii() {
        return Err(Error::KmsError(KmsError::new(
            KmsErrorKind::MalformedField,
            "non ASCII byte in ASCII field",
        )));
    }
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}
